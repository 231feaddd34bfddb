//! Packet-loss concealment: hold the last good block and fade it out.
//!
//! The first lost frame in a run replays the previous good block attenuated
//! by a fixed factor; the attenuation compounds per consecutive loss. Once
//! the loss run exceeds 60 ms of logical time the output is silence. The
//! first good frame after a run passes through untouched and resets state.

use crate::config::BLOCK_SAMPLES;

/// Attenuation applied per consecutive lost frame.
const FADE_FACTOR: f64 = 0.8;

/// Loss-run length after which output falls to silence.
const FADE_WINDOW_MS: u64 = 60;

#[derive(Debug)]
pub struct Plc {
    last_good: Vec<i16>,
    consecutive_losses: u32,
    hold_limit: u32,
}

impl Plc {
    pub fn new(tick_ms: u64) -> Self {
        Self {
            last_good: vec![0; BLOCK_SAMPLES],
            consecutive_losses: 0,
            hold_limit: (FADE_WINDOW_MS / tick_ms.max(1)).max(1) as u32,
        }
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Replace a lost frame in place; pass good frames through and remember
    /// them.
    pub fn conceal(&mut self, block: &mut [i16], lost: bool) {
        if !lost {
            self.consecutive_losses = 0;
            self.last_good.clear();
            self.last_good.extend_from_slice(block);
            return;
        }

        self.consecutive_losses += 1;
        if self.consecutive_losses > self.hold_limit {
            block.fill(0);
            return;
        }

        let attenuation = FADE_FACTOR.powi(self.consecutive_losses as i32);
        for (out, &held) in block.iter_mut().zip(&self.last_good) {
            *out = (f64::from(held) * attenuation).round() as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mean_square;

    fn good_block() -> Vec<i16> {
        vec![1_000; BLOCK_SAMPLES]
    }

    #[test]
    fn good_frames_pass_through() {
        let mut plc = Plc::new(20);
        let mut block = good_block();
        plc.conceal(&mut block, false);
        assert_eq!(block, good_block());
        assert_eq!(plc.consecutive_losses(), 0);
    }

    #[test]
    fn first_loss_replays_attenuated_hold() {
        let mut plc = Plc::new(20);
        let mut block = good_block();
        plc.conceal(&mut block, false);

        let mut lost = vec![0i16; BLOCK_SAMPLES];
        plc.conceal(&mut lost, true);
        assert!(lost.iter().all(|&s| s == 800));
    }

    #[test]
    fn attenuation_compounds_and_power_never_rises() {
        let mut plc = Plc::new(20);
        let mut block = good_block();
        plc.conceal(&mut block, false);

        let mut previous_power = mean_square(&block);
        for _ in 0..6 {
            let mut lost = vec![0i16; BLOCK_SAMPLES];
            plc.conceal(&mut lost, true);
            let power = mean_square(&lost);
            assert!(power <= previous_power);
            previous_power = power;
        }
    }

    #[test]
    fn loss_run_fades_to_silence_after_60ms() {
        let mut plc = Plc::new(20);
        let mut block = good_block();
        plc.conceal(&mut block, false);

        // 60 ms at 20 ms ticks: three faded frames, silence from the fourth.
        for _ in 0..3 {
            let mut lost = vec![0i16; BLOCK_SAMPLES];
            plc.conceal(&mut lost, true);
            assert!(lost.iter().any(|&s| s != 0));
        }
        let mut lost = vec![0i16; BLOCK_SAMPLES];
        plc.conceal(&mut lost, true);
        assert!(lost.iter().all(|&s| s == 0));
    }

    #[test]
    fn recovery_frame_passes_and_resets() {
        let mut plc = Plc::new(20);
        let mut block = good_block();
        plc.conceal(&mut block, false);
        for _ in 0..5 {
            let mut lost = vec![0i16; BLOCK_SAMPLES];
            plc.conceal(&mut lost, true);
        }

        let mut fresh = vec![123i16; BLOCK_SAMPLES];
        plc.conceal(&mut fresh, false);
        assert!(fresh.iter().all(|&s| s == 123));
        assert_eq!(plc.consecutive_losses(), 0);

        let mut lost = vec![0i16; BLOCK_SAMPLES];
        plc.conceal(&mut lost, true);
        assert!(lost.iter().all(|&s| s == 98)); // 123 × 0.8 rounded
    }
}
