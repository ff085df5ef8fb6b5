use std::path::Path;
use std::time::Duration;

/// Encoding parameters of the continuous relay
#[derive(Debug, Clone)]
pub struct RelayParams {
    pub device: String,
    pub input_format: String,
    pub framerate: u32,
    pub video_size: String,
    pub stream_url: String,
}

/// Device -> RTSP relay. Keyframe every second so consumers can cut on any second.
pub fn relay_args(params: &RelayParams) -> Vec<String> {
    let fps = params.framerate.to_string();
    let mut args: Vec<String> = Vec::new();

    args.extend(["-nostdin", "-loglevel", "info"].map(String::from));

    // input
    args.extend([
        "-f".to_string(),
        "v4l2".to_string(),
        "-input_format".to_string(),
        params.input_format.clone(),
        "-framerate".to_string(),
        fps.clone(),
        "-video_size".to_string(),
        params.video_size.clone(),
        "-i".to_string(),
        params.device.clone(),
    ]);

    // encoding
    args.extend(
        [
            "-vcodec",
            "libx264",
            "-preset",
            "ultrafast",
            "-pix_fmt",
            "yuv420p",
        ]
        .map(String::from),
    );
    args.extend([
        "-g".to_string(),
        fps.clone(),
        "-keyint_min".to_string(),
        fps,
        "-force_key_frames".to_string(),
        "expr:gte(t,n_forced*1)".to_string(),
    ]);

    // output
    args.extend(["-f", "rtsp", "-rtsp_transport", "tcp"].map(String::from));
    args.push(params.stream_url.clone());

    args
}

/// Single-frame blackdetect probe against the live stream
pub fn probe_args(stream_url: &str) -> Vec<String> {
    vec![
        "-rtsp_transport".to_string(),
        "tcp".to_string(),
        "-i".to_string(),
        stream_url.to_string(),
        "-vframes".to_string(),
        "1".to_string(),
        "-vf".to_string(),
        "blackdetect=d=0.1:pix_th=0.01".to_string(),
        "-an".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]
}

pub fn still_args(stream_url: &str, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-loglevel", "error", "-rtsp_transport", "tcp"]
        .map(String::from)
        .to_vec();
    args.extend(["-i".to_string(), stream_url.to_string()]);
    args.extend(["-frames:v", "1", "-f", "image2"].map(String::from));
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Recording from the relay. `duration` becomes ffmpeg's own stop condition.
pub fn record_args(stream_url: &str, duration: Option<Duration>, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-rtsp_transport", "tcp"].map(String::from).to_vec();

    if let Some(duration) = duration {
        args.extend(["-t".to_string(), seconds(duration.as_secs_f64())]);
    }

    args.extend(["-i".to_string(), stream_url.to_string()]);
    args.extend(["-vcodec", "libx264", "-pix_fmt", "yuv420p"].map(String::from));
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Re-encode `input` from `start_at` seconds into `output`
pub fn trim_args(input: &Path, start_at: f64, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".to_string(), "-i".to_string()];
    args.push(input.to_string_lossy().into_owned());
    args.extend(["-ss".to_string(), seconds(start_at)]);
    args.extend(
        ["-c:v", "libx264", "-preset", "ultrafast", "-c:a", "aac"].map(String::from),
    );
    args.push(output.to_string_lossy().into_owned());
    args
}

fn seconds(value: f64) -> String {
    format!("{:.3}", value)
}
