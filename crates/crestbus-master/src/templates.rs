//! Configuration sequences per device type.
//!
//! Each template step is sent as `[address] ++ payload`.
//!
//! The `InitSync`, `TimeSync` and `Finalize` framing follows the bus
//! opcodes. The `ChannelConfig` and `LoadConfig` payloads are placeholder
//! sequences, not captured device traffic; replace them with real captures
//! before driving hardware that checks them.

use crestbus_core::protocol::{CONFIG_REQUEST, DIM, TIME_SYNC};
use crestbus_core::types::{ConfigStep, DeviceType};

/// One step of a configuration template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateStep {
    pub step: ConfigStep,
    pub payload: &'static [u8],
}

const INIT_SYNC: TemplateStep = TemplateStep {
    step: ConfigStep::InitSync,
    payload: &[CONFIG_REQUEST, 0x00],
};

const TIME_SYNC_STEP: TemplateStep = TemplateStep {
    step: ConfigStep::TimeSync,
    payload: &[TIME_SYNC, 0x08, 0x0E, 0x15, 0x45, 0x29, 0x05, 0x20, 0x20],
};

/// Eight dimmable channels.
const CHANNEL_CONFIG: TemplateStep = TemplateStep {
    step: ConfigStep::ChannelConfig,
    payload: &[0x05, 0x0C, 0x00, 0x08],
};

/// Every channel to level 0 with no ramp.
const LOAD_CONFIG: TemplateStep = TemplateStep {
    step: ConfigStep::LoadConfig,
    payload: &[0x08, DIM, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00],
};

const FINALIZE: TemplateStep = TemplateStep {
    step: ConfigStep::Finalize,
    payload: &[CONFIG_REQUEST, 0x01],
};

const IO48_TEMPLATE: &[TemplateStep] = &[INIT_SYNC, TIME_SYNC_STEP, FINALIZE];

const DIMMER_TEMPLATE: &[TemplateStep] =
    &[INIT_SYNC, TIME_SYNC_STEP, CHANNEL_CONFIG, LOAD_CONFIG, FINALIZE];

/// The configuration sequence for `device_type`, in send order.
pub fn template_for(device_type: DeviceType) -> &'static [TemplateStep] {
    match device_type {
        DeviceType::Io48 => IO48_TEMPLATE,
        DeviceType::Dim8 | DeviceType::DimU8 => DIMMER_TEMPLATE,
    }
}

/// The step that follows `current` in the template, or `None` once the
/// template is exhausted. `ConfigStep::None` yields the first step.
pub fn next_step(device_type: DeviceType, current: ConfigStep) -> Option<&'static TemplateStep> {
    let template = template_for(device_type);
    if current == ConfigStep::None {
        return template.first();
    }
    let index = template.iter().position(|s| s.step == current)?;
    template.get(index + 1)
}

/// Whether `step` is the final step of the template for `device_type`.
pub fn is_last_step(device_type: DeviceType, step: ConfigStep) -> bool {
    template_for(device_type)
        .last()
        .is_some_and(|last| last.step == step)
}

/// Build the frame for `step` addressed to `address`.
pub fn step_frame(address: u8, step: &TemplateStep) -> Vec<u8> {
    let mut frame = Vec::with_capacity(step.payload.len() + 1);
    frame.push(address);
    frame.extend_from_slice(step.payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimmer_template_runs_every_step() {
        let steps: Vec<ConfigStep> = template_for(DeviceType::Dim8)
            .iter()
            .map(|s| s.step)
            .collect();
        assert_eq!(
            steps,
            vec![
                ConfigStep::InitSync,
                ConfigStep::TimeSync,
                ConfigStep::ChannelConfig,
                ConfigStep::LoadConfig,
                ConfigStep::Finalize,
            ]
        );
    }

    #[test]
    fn io48_skips_channel_steps() {
        let steps: Vec<ConfigStep> = template_for(DeviceType::Io48)
            .iter()
            .map(|s| s.step)
            .collect();
        assert_eq!(
            steps,
            vec![ConfigStep::InitSync, ConfigStep::TimeSync, ConfigStep::Finalize]
        );
    }

    #[test]
    fn steps_are_in_increasing_order() {
        for device in [DeviceType::Io48, DeviceType::Dim8, DeviceType::DimU8] {
            let template = template_for(device);
            assert!(template.windows(2).all(|w| w[0].step < w[1].step));
        }
    }

    #[test]
    fn next_step_walks_template() {
        let first = next_step(DeviceType::Io48, ConfigStep::None).unwrap();
        assert_eq!(first.step, ConfigStep::InitSync);
        let second = next_step(DeviceType::Io48, first.step).unwrap();
        assert_eq!(second.step, ConfigStep::TimeSync);
        let third = next_step(DeviceType::Io48, second.step).unwrap();
        assert_eq!(third.step, ConfigStep::Finalize);
        assert!(next_step(DeviceType::Io48, third.step).is_none());
        assert!(next_step(DeviceType::Io48, ConfigStep::ChannelConfig).is_none());
    }

    #[test]
    fn last_step_is_finalize() {
        assert!(is_last_step(DeviceType::DimU8, ConfigStep::Finalize));
        assert!(!is_last_step(DeviceType::DimU8, ConfigStep::LoadConfig));
    }

    #[test]
    fn time_sync_frame_bytes() {
        let frame = step_frame(0x0B, &TIME_SYNC_STEP);
        assert_eq!(
            frame,
            vec![0x0B, 0x08, 0x08, 0x0E, 0x15, 0x45, 0x29, 0x05, 0x20, 0x20]
        );
    }
}
