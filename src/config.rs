use std::time::Duration;

use relay_core::{
    abr::{AutoBitRateCalculator, AutoBitRateConfig},
    codec::FpsFraction,
    error::RelayError,
    recoder::{CodecConfig, RecoderConfig},
    runtime::RuntimeConfig,
    sender::OutputTemplate,
    switch::RoutingMode,
};

use crate::cli::Cli;

/// Queue depth at or below which auto bitrate steps back up.
const AUTO_BITRATE_LOW_WATERMARK: usize = 2;

fn codec_config(
    codec_name: &str,
    bit_rate: Option<u64>,
    averaging_period: Duration,
    options: &[(String, String)],
    cli: &Cli,
) -> CodecConfig {
    CodecConfig {
        codec_name: codec_name.to_string(),
        averaging_period,
        average_bit_rate: bit_rate.unwrap_or(0),
        custom_options: options.to_vec(),
        hardware_device_type: cli.hwaccel.clone().unwrap_or_default(),
        hardware_device_name: cli.hwaccel_device.clone().unwrap_or_default(),
    }
}

/// Turns the command line into a runtime configuration, refusing anything
/// the relay cannot do before a single resource is opened.
pub fn runtime_config(cli: &Cli) -> anyhow::Result<RuntimeConfig> {
    cli.reject_unsupported()?;
    if cli.inputs.is_empty() {
        anyhow::bail!("at least one input (-i) is required");
    }
    if cli.outputs.len() != 1 {
        return Err(RelayError::OutputCount(cli.outputs.len()).into());
    }

    let output = OutputTemplate {
        url_template: cli.outputs[0].clone(),
        format: cli.format.clone(),
        options: cli.output_options.clone(),
        retry: cli.retry_output,
        retry_backoff_ms: cli.retry_backoff_ms,
        drop_on_close: cli.drop_on_close,
    };

    let averaging_period = Duration::from_millis(cli.averaging_period_ms);
    let recoder = RecoderConfig {
        audio: codec_config(&cli.audio_codec, None, averaging_period, &cli.audio_options, cli),
        video: codec_config(
            &cli.video_codec,
            cli.video_bitrate,
            averaging_period,
            &cli.video_options,
            cli,
        ),
    };
    if !recoder.audio.is_copy() {
        return Err(RelayError::AudioTranscodingUnsupported(recoder.audio.codec_name).into());
    }

    let mut config = RuntimeConfig::new(cli.inputs.clone(), output);
    config.recoder = recoder;
    config.queue_tolerance = cli.queue_tolerance;
    if cli.separate_tracks {
        config.routing = RoutingMode::BothPipes;
        config.sample_every = cli.sample_every;
    }
    if let Some((num, den)) = cli.fps_fraction {
        config.fps = FpsFraction::new(num, den)?;
    }
    if let Some(step) = cli.auto_bitrate_step {
        config.auto_bitrate = AutoBitRateConfig {
            calculator: AutoBitRateCalculator::QueueThresholds {
                step,
                low_watermark: AUTO_BITRATE_LOW_WATERMARK,
            },
            tiers: config.tiers.clone(),
            ..Default::default()
        };
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<RuntimeConfig> {
        let mut argv = vec!["av-relay"];
        argv.extend_from_slice(args);
        runtime_config(&Cli::try_parse_from(argv)?)
    }

    #[test]
    fn test_exactly_one_output() {
        let err = parse(&["-i", "a.ts"]).unwrap_err();
        assert_eq!(err.downcast_ref::<RelayError>(), Some(&RelayError::OutputCount(0)));

        let err = parse(&["-i", "a.ts", "-o", "b.ts", "-o", "c.ts"]).unwrap_err();
        assert_eq!(err.downcast_ref::<RelayError>(), Some(&RelayError::OutputCount(2)));
    }

    #[test]
    fn test_audio_must_be_copied() {
        let err = parse(&["-i", "a.ts", "-o", "b.ts", "--audio-codec", "aac"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::AudioTranscodingUnsupported(_))
        ));
    }

    #[test]
    fn test_full_command_line() {
        let config = parse(&[
            "-i",
            "rtsp://cam-a;rtsp_transport=tcp",
            "-i",
            "1:rtsp://cam-b",
            "-o",
            "rtmp://live/{resolution}",
            "--retry-output",
            "--video-codec",
            "libx264",
            "--video-bitrate",
            "2M",
            "--video-option",
            "preset=veryfast",
            "--hwaccel",
            "cuda",
            "--separate-tracks",
            "--fps-fraction",
            "1/2",
            "--auto-bitrate-step",
            "250k",
        ])
        .unwrap();
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[1].fallback_priority, 1);
        assert!(config.output.retry);
        assert_eq!(config.output.container_format().as_deref(), Some("flv"));
        assert_eq!(config.recoder.video.codec_name, "libx264");
        assert_eq!(config.recoder.video.average_bit_rate, 2_000_000);
        assert_eq!(config.recoder.video.hardware_device_type, "cuda");
        assert_eq!(config.routing, RoutingMode::BothPipes);
        assert_eq!(config.fps, FpsFraction::new(1, 2).unwrap());
        assert!(matches!(
            config.auto_bitrate.calculator,
            AutoBitRateCalculator::QueueThresholds { step: 250_000, .. }
        ));
    }

    #[test]
    fn test_rejected_before_anything_else() {
        let err = parse(&["-o", "b.ts", "--filter-complex", "[0:v]scale"]).unwrap_err();
        assert!(err.to_string().contains("--filter-complex"));
    }
}
