use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "kinocast-server")]
#[command(about = "Multi-channel video playout engine")]
pub struct Cli {
    /// Address the JSON control surface listens on.
    #[arg(long, default_value = "127.0.0.1:4750")]
    pub control_addr: String,

    /// Local-socket path template for channel output; `%d` becomes the
    /// channel id. Without it, channels stream over TCP.
    #[arg(long)]
    pub ts_socket_template: Option<String>,

    /// Master clock rate offset in parts-per-million.
    #[arg(long, default_value_t = 0)]
    pub rate_ppm: i64,

    /// Decode synthetic test-pattern frames instead of reading assets.
    #[arg(long, default_value_t = false)]
    pub fake_video: bool,

    /// Target frames per second for every channel.
    #[arg(long, default_value_t = 30.0)]
    pub fps: f64,

    /// Frame ring capacity in frames.
    #[arg(long, default_value_t = 60)]
    pub buffer_capacity: usize,
}
