mod cli;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kinocast_core::config::{ChannelConfig, EngineConfig};
use kinocast_core::protocol::{Request, Response};
use kinocast_playout::engine::PlayoutEngine;
use kinocast_playout::error::EngineError;
use kinocast_telemetry::MetricsStore;
use kinocast_timing::SystemClock;

use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine_config = EngineConfig {
        rate_ppm: cli.rate_ppm,
        fake_video: cli.fake_video
            || std::env::var("KINOCAST_FAKE_VIDEO").map(|v| v == "1").unwrap_or(false),
        ts_socket_template: cli
            .ts_socket_template
            .clone()
            .or_else(|| std::env::var("KINOCAST_TS_SOCKET_PATH").ok()),
        ..EngineConfig::default()
    };
    let channel_defaults = ChannelConfig {
        target_fps: cli.fps,
        buffer_capacity: cli.buffer_capacity,
        ..ChannelConfig::default()
    };

    let clock = Arc::new(SystemClock::with_wall_epoch(cli.rate_ppm));
    let metrics = Arc::new(MetricsStore::new());
    let engine = Arc::new(PlayoutEngine::new(
        clock,
        metrics,
        engine_config,
        channel_defaults,
    ));

    let listener = TcpListener::bind(&cli.control_addr)
        .with_context(|| format!("failed to bind control surface on {}", cli.control_addr))?;
    info!(addr = %cli.control_addr, "control surface listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = Arc::clone(&engine);
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                if let Err(error) = std::thread::Builder::new()
                    .name("kinocast-control".to_string())
                    .spawn(move || serve_connection(engine, stream, peer))
                {
                    warn!(%error, "failed to spawn control connection thread");
                }
            }
            Err(error) => warn!(%error, "control accept failed"),
        }
    }
    Ok(())
}

fn serve_connection(engine: Arc<PlayoutEngine>, stream: TcpStream, peer: String) {
    info!(peer, "control client connected");
    let reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(error) => {
            warn!(peer, %error, "failed to clone control stream");
            return;
        }
    });
    let mut writer = stream;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                warn!(peer, %error, "control read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&engine, request),
            Err(error) => Response::error(format!("malformed request: {error}")),
        };
        let mut payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(peer, %error, "failed to serialize response");
                break;
            }
        };
        payload.push('\n');
        if writer.write_all(payload.as_bytes()).is_err() {
            break;
        }
    }
    info!(peer, "control client disconnected");
}

fn dispatch(engine: &Arc<PlayoutEngine>, request: Request) -> Response {
    match request {
        Request::StartChannel {
            channel_id,
            plan_handle,
            port,
            uds_path,
        } => match engine.start_channel(channel_id, &plan_handle, port, uds_path) {
            Ok(outcome) => Response::ok(outcome.message),
            Err(error) => engine_error_response(error),
        },
        Request::StopChannel { channel_id } => match engine.stop_channel(channel_id) {
            Ok(outcome) => Response::ok(outcome.message),
            Err(error) => engine_error_response(error),
        },
        Request::LoadPreview {
            channel_id,
            asset_path,
            asset_id,
        } => match engine.load_preview(channel_id, &asset_path, &asset_id) {
            Ok(outcome) => Response {
                shadow_decode_started: Some(outcome.shadow_decode_started),
                ..Response::ok(outcome.message)
            },
            Err(error) => engine_error_response(error),
        },
        Request::SwitchToLive { channel_id } => match engine.switch_to_live(channel_id) {
            Ok(outcome) => Response {
                pts_contiguous: Some(outcome.pts_contiguous),
                live_start_pts: Some(outcome.live_start_pts),
                ..Response::ok(format!("channel {channel_id} switched to live"))
            },
            Err(error) => engine_error_response(error),
        },
        Request::UpdatePlan {
            channel_id,
            plan_handle,
        } => match engine.update_plan(channel_id, &plan_handle) {
            Ok(outcome) => Response::ok(outcome.message),
            Err(error) => engine_error_response(error),
        },
        Request::GetVersion => Response {
            version: Some(engine.version().to_string()),
            ..Response::ok("ok")
        },
    }
}

fn engine_error_response(error: EngineError) -> Response {
    Response::error(error.to_string())
}
