//! Drives the encoder bitrate from the depth of the active sender's queue.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    recoder::RecoderManager,
    sender::{BitrateTier, SenderHub, TierTable},
    stream::Resolution,
    switch::{PathKind, Switch},
};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// What the controller watches.
pub trait QueueMonitor: Send + Sync {
    fn queue_len(&self) -> usize;
    fn queue_tolerance(&self) -> usize;
    fn active_resolution(&self) -> Option<Resolution>;
}

impl QueueMonitor for SenderHub {
    fn queue_len(&self) -> usize {
        SenderHub::queue_len(self)
    }

    fn queue_tolerance(&self) -> usize {
        SenderHub::queue_tolerance(self)
    }

    fn active_resolution(&self) -> Option<Resolution> {
        self.active_key().map(|key| key.video_resolution)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutoBitRateCalculator {
    #[default]
    Disabled,
    /// Step down while the queue is above tolerance, step up while it holds
    /// at most `low_watermark` units.
    QueueThresholds { step: u64, low_watermark: usize },
}

impl AutoBitRateCalculator {
    /// The bitrate to move to, if any. A `current` of 0 (codec default)
    /// counts as the top of the tier.
    pub fn next_bitrate(
        &self,
        current: u64,
        queue_len: usize,
        tolerance: usize,
        tier: &BitrateTier,
    ) -> Option<u64> {
        let AutoBitRateCalculator::QueueThresholds { step, low_watermark } = self else {
            return None;
        };
        let current = if current == 0 { tier.bitrate_high } else { current };
        let target = if queue_len > tolerance {
            current.saturating_sub(*step)
        } else if queue_len <= *low_watermark {
            current.saturating_add(*step)
        } else {
            current
        };
        let target = tier.clamp(target);
        (target != current).then_some(target)
    }
}

fn default_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL.as_millis() as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoBitRateConfig {
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub calculator: AutoBitRateCalculator,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for AutoBitRateConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            calculator: AutoBitRateCalculator::Disabled,
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl AutoBitRateConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let AutoBitRateCalculator::QueueThresholds { step: 0, .. } = self.calculator {
            anyhow::bail!("auto bitrate step must be positive");
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    fn tier_for(&self, resolution: Option<Resolution>) -> BitrateTier {
        resolution
            .and_then(|r| self.tiers.tiers().iter().find(|t| t.resolution == r).copied())
            .unwrap_or_else(|| self.tiers.best())
    }
}

pub struct AutoBitRate {
    config: Mutex<AutoBitRateConfig>,
    recoder: Arc<RecoderManager>,
    switch: Arc<Switch>,
    monitor: Arc<dyn QueueMonitor>,
}

impl AutoBitRate {
    pub fn new(
        config: AutoBitRateConfig,
        recoder: Arc<RecoderManager>,
        switch: Arc<Switch>,
        monitor: Arc<dyn QueueMonitor>,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            recoder,
            switch,
            monitor,
        }
    }

    pub fn config(&self) -> AutoBitRateConfig {
        self.config.lock().clone()
    }

    pub fn set_config(&self, config: AutoBitRateConfig) {
        let mut current = self.config.lock();
        if *current != config {
            log::info!("auto bitrate: {:?}", config.calculator);
            *current = config;
        }
    }

    /// One check. Returns the bitrate that was applied, if it changed.
    pub fn check(&self) -> anyhow::Result<Option<u64>> {
        let config = self.config();
        if config.calculator == AutoBitRateCalculator::Disabled {
            return Ok(None);
        }
        // the passthrough path has its own throttle
        if self.switch.next_value() != PathKind::Transcode {
            return Ok(None);
        }
        let Some(current) = self.recoder.video_bitrate() else {
            return Ok(None);
        };
        let tier = config.tier_for(self.monitor.active_resolution());
        let queue_len = self.monitor.queue_len();
        let Some(target) = config.calculator.next_bitrate(
            current,
            queue_len,
            self.monitor.queue_tolerance(),
            &tier,
        ) else {
            return Ok(None);
        };
        log::debug!(
            "auto bitrate: queue {} -> {} bps (was {})",
            queue_len,
            target,
            current
        );
        self.recoder.set_video_bitrate(target)?;
        Ok(Some(target))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let interval = self.config.lock().check_interval();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.check() {
                log::warn!("auto bitrate: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        codec::testing::MockEngine,
        recoder::{CodecConfig, RecoderConfig},
        throttle::BitrateThrottle,
    };

    struct FakeQueue {
        len: AtomicUsize,
        tolerance: usize,
    }

    impl QueueMonitor for FakeQueue {
        fn queue_len(&self) -> usize {
            self.len.load(Ordering::SeqCst)
        }
        fn queue_tolerance(&self) -> usize {
            self.tolerance
        }
        fn active_resolution(&self) -> Option<Resolution> {
            Some(Resolution::new(1280, 720))
        }
    }

    fn thresholds() -> AutoBitRateCalculator {
        AutoBitRateCalculator::QueueThresholds {
            step: 500_000,
            low_watermark: 2,
        }
    }

    #[test]
    fn test_calculator_clamps_to_tier() {
        let tier = BitrateTier::new(1280, 720, 1_500_000, 4_000_000);
        let calc = thresholds();
        assert_eq!(calc.next_bitrate(3_000_000, 50, 10, &tier), Some(2_500_000));
        assert_eq!(calc.next_bitrate(1_700_000, 50, 10, &tier), Some(1_500_000));
        assert_eq!(calc.next_bitrate(1_500_000, 50, 10, &tier), None);
        assert_eq!(calc.next_bitrate(3_000_000, 0, 10, &tier), Some(3_500_000));
        assert_eq!(calc.next_bitrate(4_000_000, 0, 10, &tier), None);
        assert_eq!(calc.next_bitrate(3_000_000, 5, 10, &tier), None);
        assert_eq!(calc.next_bitrate(0, 50, 10, &tier), Some(3_500_000));
        assert_eq!(
            AutoBitRateCalculator::Disabled.next_bitrate(3_000_000, 50, 10, &tier),
            None
        );
    }

    #[test]
    fn test_applies_only_while_transcoding() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        let counters = Arc::clone(&engine.counters);
        let switch = Arc::new(Switch::new(PathKind::Passthrough));
        let recoder = Arc::new(RecoderManager::new(
            Arc::new(engine),
            Arc::clone(&switch),
            Arc::new(BitrateThrottle::default()),
            false,
        ));
        let queue = Arc::new(FakeQueue {
            len: AtomicUsize::new(100),
            tolerance: 10,
        });
        let abr = AutoBitRate::new(
            AutoBitRateConfig {
                calculator: thresholds(),
                ..Default::default()
            },
            Arc::clone(&recoder),
            Arc::clone(&switch),
            queue.clone(),
        );

        // passthrough: nothing to drive
        assert_eq!(abr.check()?, None);

        recoder.configure(RecoderConfig {
            audio: CodecConfig::copy(),
            video: CodecConfig::new("libx265").with_bit_rate(3_000_000),
        })?;
        assert_eq!(abr.check()?, Some(2_500_000));
        assert_eq!(recoder.video_bitrate(), Some(2_500_000));
        assert_eq!(recoder.recoder_config().video.average_bit_rate, 2_500_000);

        queue.len.store(0, Ordering::SeqCst);
        assert_eq!(abr.check()?, Some(3_000_000));

        abr.set_config(AutoBitRateConfig::default());
        assert_eq!(abr.check()?, None);
        // no live encoder yet, so nothing reached set_quality
        assert_eq!(counters.set_quality_calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_config_json() {
        let config: AutoBitRateConfig = serde_json::from_str(
            r#"{"calculator":{"type":"queue_thresholds","step":250000,"low_watermark":4},"check_interval_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.check_interval(), Duration::from_millis(500));
        assert_eq!(
            config.calculator,
            AutoBitRateCalculator::QueueThresholds {
                step: 250_000,
                low_watermark: 4
            }
        );
        assert_eq!(config.tiers, TierTable::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_inconsistent_tiers() {
        let err = serde_json::from_str::<AutoBitRateConfig>(r#"{"tiers":{"tiers":[],"best":0}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("best tier 0 out of range"));

        let table: TierTable = serde_json::from_str(
            r#"{"tiers":[{"resolution":{"width":640,"height":360},"bitrate_low":1,"bitrate_high":2}],"best":0}"#,
        )
        .unwrap();
        assert_eq!(table.best().resolution, Resolution::new(640, 360));

        let zero_step: AutoBitRateConfig =
            serde_json::from_str(r#"{"calculator":{"type":"queue_thresholds","step":0,"low_watermark":1}}"#)
                .unwrap();
        assert!(zero_step.validate().is_err());
    }
}
