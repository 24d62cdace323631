use std::sync::Arc;

use clap::Parser;
use relay_core::{
    codec::{self, CodecKind},
    runtime::{Backends, ForwarderRuntime},
};
use tokio_util::sync::CancellationToken;

mod api;
mod cli;
mod config;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("relay_core", log::LevelFilter::Debug)
        .filter_module("av_relay", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

fn print_codecs(kind: CodecKind) {
    for info in codec::list_codecs(kind) {
        let media = format!("{:?}", info.media_type);
        println!("{:<24} {:<8} {}", info.name, media, info.description);
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let cli = cli::Cli::parse();

    if let Err(e) = relay_core::init() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
    if cli.encoders || cli.decoders {
        if cli.encoders {
            print_codecs(CodecKind::Encoder);
        }
        if cli.decoders {
            print_codecs(CodecKind::Decoder);
        }
        std::process::exit(0);
    }

    let runtime = match config::runtime_config(&cli)
        .and_then(|config| ForwarderRuntime::new(config, Backends::ffmpeg()))
    {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            log::error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let api = cli
        .listen_control
        .map(|addr| api::start_api_server(addr, Arc::clone(&runtime), cancel.clone()));

    let serving = Arc::clone(&runtime);
    let mut serve = tokio::spawn(async move { serving.serve().await });

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping");
                runtime.stop();
            },
            joined = &mut serve => {
                break match joined {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                };
            },
        }
    };

    cancel.cancel();
    if let Some(api) = api {
        let _ = api.await;
    }

    match result {
        Ok(()) => {
            log::info!("relay finished");
            std::process::exit(0);
        }
        Err(e) => {
            log::error!("relay failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
