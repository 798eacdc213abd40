//! Timer-driven state machine (spec component C6, §4.4, §4.6 state
//! machine).
//!
//! One [`Engine`] per device endpoint (spec §1 Non-goals: "does not attempt
//! to drive multiple devices from one instance"). `direction` picks which
//! tick handler `tick()` dispatches to; a clock-slaved engine instead has
//! its `slaved_tick()` driven by whichever loop ticks the graph's master.

use crate::buffer::{BufferDescriptor, BufferPool};
use crate::clock::{ClockHandle, ClockRecord, Coordinator, ThresholdOverride};
use crate::config::EngineConfig;
use crate::device::{AvailOutcome, EnumCursor, FormatFilter, FormatRequest, NegotiatedFormat, ParamObject, PcmDevice, SetFormatFlags};
use crate::dll::Dll;
use crate::error::{EngineError, Result};
use crate::io::{publish, HostCallbacks, IoSlot, IoStatus};
use crate::timer::{MonotonicClock, OneShotTimer};
use crate::transfer::{self, DeadlineInputs, NS_PER_SEC};
use crate::Direction;

/// `Closed → Opened → Configured → Started{Running,Recovering} ↔ Paused →
/// Closed` (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    Opened,
    Configured,
    Started(RunState),
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Recovering,
}

/// Ties the device layer, buffer pool, DLL, clock coordinator, and timer
/// together into the scheduling loop (spec §2 "C6 drives C5, which
/// consults C3 ... and C4").
pub struct Engine<D: PcmDevice, T: OneShotTimer + MonotonicClock> {
    device: D,
    timer: T,
    pool: BufferPool,
    dll: Dll,
    coordinator: Coordinator,
    handle: ClockHandle,
    threshold_override: ThresholdOverride,
    io_slot: IoSlot,
    config: EngineConfig,
    state: EngineState,
    slaved: bool,
    samples_produced: u64,
    last_time: u64,
    alsa_started: bool,
}

impl<D: PcmDevice, T: OneShotTimer + MonotonicClock> Engine<D, T> {
    pub fn new(device: D, timer: T, coordinator: Coordinator, config: EngineConfig) -> Self {
        let handle = coordinator.register();
        Engine {
            device,
            timer,
            pool: BufferPool::new(),
            dll: Dll::new(1.0),
            coordinator,
            handle,
            threshold_override: ThresholdOverride::new(),
            io_slot: IoSlot::new(),
            config,
            state: EngineState::Opened,
            slaved: false,
            samples_produced: 0,
            last_time: 0,
            alsa_started: false,
        }
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle
    }

    pub fn io_slot(&self) -> IoSlot {
        self.io_slot.clone()
    }

    pub fn threshold_override(&self) -> ThresholdOverride {
        self.threshold_override.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn samples_produced(&self) -> u64 {
        self.samples_produced
    }

    pub fn set_slaved(&mut self, slaved: bool) {
        self.slaved = slaved;
    }

    pub fn is_started(&self) -> bool {
        self.alsa_started
    }

    fn threshold(&self) -> i64 {
        self.threshold_override.get().unwrap_or(self.config.min_latency) as i64
    }

    fn negotiated(&self) -> Result<NegotiatedFormat> {
        self.device.negotiated().cloned().ok_or_else(|| EngineError::illegal_state("tick before set_format"))
    }

    /// §4.1 "Set format"; valid from `Opened` or `Configured`.
    pub fn set_format(&mut self, request: &FormatRequest, flags: SetFormatFlags) -> Result<NegotiatedFormat> {
        if !matches!(self.state, EngineState::Opened | EngineState::Configured) {
            return Err(EngineError::illegal_state("set_format only valid from Opened/Configured"));
        }
        let negotiated = self.device.set_format(request, flags)?;
        self.state = EngineState::Configured;
        Ok(negotiated)
    }

    /// §4.1 "Enumerate formats", gated by `EngineConfig::enumerate_channel_maps`
    /// (spec §4.1 Open Question - whether a channel map query runs at all).
    pub fn enumerate_formats(&self, filter: Option<&FormatFilter>, cursor: EnumCursor) -> Vec<ParamObject> {
        self.device.enumerate_formats(filter, cursor, self.config.enumerate_channel_maps)
    }

    /// Seed the buffer pool with the host's fixed descriptor set (spec
    /// §4.2). For playback every descriptor starts `OUT` (the pool holds
    /// none); for capture every descriptor starts on `free`.
    pub fn configure_buffers(&mut self, descriptors: Vec<BufferDescriptor>) {
        self.pool.reset(descriptors, self.config.direction);
    }

    /// `submit_buffer` (spec §6.1): playback appends to `ready`, capture
    /// appends to `free`.
    pub fn submit_buffer(&mut self, d: BufferDescriptor) {
        match self.config.direction {
            Direction::Playback => self.pool.push_ready(d),
            Direction::Capture => self.pool.submit_free(d),
        }
    }

    /// `open; close; open` yields a session equivalent to a fresh open
    /// (spec §8 round-trip property): resets counters and the DLL.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, EngineState::Configured | EngineState::Paused) {
            return Err(EngineError::illegal_state("start only valid from Configured/Paused"));
        }
        let negotiated = self.negotiated()?;
        self.dll = Dll::new(negotiated.period_frames as f64 / negotiated.rate as f64);
        self.samples_produced = 0;
        self.alsa_started = false;
        self.last_time = self.timer.now_ns();
        self.state = EngineState::Started(RunState::Running);

        if self.config.direction == Direction::Capture && !self.slaved {
            self.device.start()?;
            self.alsa_started = true;
        }

        if !self.slaved {
            self.timer.arm_absolute(self.last_time + 1)?;
        }
        Ok(())
    }

    /// Idempotent after the first call (spec §8 round-trip property).
    pub fn pause(&mut self) -> Result<()> {
        if self.state == EngineState::Paused {
            return Ok(());
        }
        self.timer.disarm()?;
        self.state = EngineState::Paused;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let _ = self.timer.disarm();
        let _ = self.device.stop();
        self.state = EngineState::Closed;
        Ok(())
    }

    fn arm_next(&mut self, deadline_ns: u64) -> Result<()> {
        if !self.slaved {
            self.timer.arm_absolute(deadline_ns)?;
        }
        Ok(())
    }

    fn enter_recovering(&mut self) -> Result<()> {
        self.state = EngineState::Started(RunState::Recovering);
        transfer::recover(&mut self.device, &mut self.dll, self.threshold() as usize, self.config.direction)?;
        self.state = EngineState::Started(RunState::Running);
        Ok(())
    }

    fn publish_clock(&mut self, now_ns: u64, rate: u32, sdelay: i64, dt: f64) {
        self.coordinator.publish(
            self.handle,
            ClockRecord { nsec: self.last_time, rate_hz: rate, position: self.samples_produced as i64, delay: sdelay, rate_diff: dt },
        );
        self.last_time = now_ns;
    }

    /// §4.4 "Playback tick".
    pub fn playback_tick<H: HostCallbacks>(&mut self, callbacks: &mut H) -> Result<()> {
        let negotiated = self.negotiated()?;
        let threshold = self.threshold();
        let now_ns = self.timer.now_ns();
        let now_s = now_ns as f64 / NS_PER_SEC;

        let delay = match self.device.avail_delay()? {
            AvailOutcome::Ready { delay, .. } => delay,
            AvailOutcome::Xrun => {
                self.enter_recovering()?;
                return self.arm_next(now_ns + 1);
            }
        };

        if delay >= 2 * threshold {
            let next = now_ns + ((threshold as f64 / 2.0 / negotiated.rate as f64) * NS_PER_SEC) as u64;
            return self.arm_next(next);
        }

        let elapsed_s = (now_ns.saturating_sub(self.last_time)) as f64 / NS_PER_SEC;
        let outcome = transfer::compute_next_deadline(
            &mut self.dll,
            DeadlineInputs { now_s, sdelay: -delay, rate: negotiated.rate, elapsed_s, safety_s: self.config.safety_seconds, extra_s: 0.0 },
        );
        self.publish_clock(now_ns, negotiated.rate, -delay, outcome.dt);

        // Priming: the very first tick after start(), before any real data
        // has arrived, writes silence to get the device running rather than
        // immediately asking the host for buffers (spec §8 scenario 2).
        let priming = !self.alsa_started && self.pool.ready_is_empty();

        if priming {
            let write = transfer::playback_write(
                &mut self.device,
                &mut self.pool,
                &self.io_slot,
                callbacks,
                negotiated.frame_size,
                2 * threshold as usize,
                true,
                self.alsa_started,
            )?;
            self.samples_produced += write.written as u64;
            self.alsa_started = write.started;
            if write.xrun {
                self.enter_recovering()?;
            }
        } else if self.pool.ready_is_empty() {
            publish(&self.io_slot, callbacks, IoStatus::NeedBuffer, None);
            log::debug!(
                "playback: ready empty, requesting bytes [{}, +{})",
                self.samples_produced as usize * negotiated.frame_size,
                threshold as usize * negotiated.frame_size
            );
        } else {
            let write =
                transfer::playback_write(&mut self.device, &mut self.pool, &self.io_slot, callbacks, negotiated.frame_size, 0, true, self.alsa_started)?;
            self.samples_produced += write.written as u64;
            self.alsa_started = write.started;
            if write.xrun {
                self.enter_recovering()?;
            }
        }

        self.arm_next(outcome.next_time_ns)
    }

    /// §4.4 "Capture tick".
    pub fn capture_tick<H: HostCallbacks>(&mut self, callbacks: &mut H) -> Result<()> {
        let negotiated = self.negotiated()?;
        let threshold = self.threshold();
        let now_ns = self.timer.now_ns();
        let now_s = now_ns as f64 / NS_PER_SEC;

        let delay = match self.device.avail_delay()? {
            AvailOutcome::Ready { delay, .. } => delay,
            AvailOutcome::Xrun => {
                self.enter_recovering()?;
                return self.arm_next(now_ns + 1);
            }
        };

        if delay < threshold {
            let next = now_ns + (((threshold - delay) as f64 / negotiated.rate as f64) * NS_PER_SEC) as u64;
            return self.arm_next(next);
        }

        // Master case (spec.md §4.3: "elapsed is the wall-clock delta between
        // consecutive ticks in the master case" - capture_tick is a master
        // handler, unlike slaved_tick, which keeps the threshold/rate form).
        let elapsed_s = (now_ns.saturating_sub(self.last_time)) as f64 / NS_PER_SEC;
        let extra_s = threshold as f64 / negotiated.rate as f64;
        let outcome = transfer::compute_next_deadline(
            &mut self.dll,
            DeadlineInputs { now_s, sdelay: delay - threshold, rate: negotiated.rate, elapsed_s, safety_s: self.config.safety_seconds, extra_s },
        );
        self.publish_clock(now_ns, negotiated.rate, delay - threshold, outcome.dt);

        let to_transfer = delay.min(threshold).max(0) as usize;
        let n = transfer::capture_push(&mut self.device, &mut self.pool, &self.io_slot, callbacks, to_transfer, negotiated.frame_size, self.samples_produced)?;
        self.samples_produced += n as u64;

        self.arm_next(outcome.next_time_ns)
    }

    /// Dispatch by configured direction (spec §9 "one dispatch choice per
    /// engine at start").
    pub fn tick<H: HostCallbacks>(&mut self, callbacks: &mut H) -> Result<()> {
        match self.config.direction {
            Direction::Playback => self.playback_tick(callbacks),
            Direction::Capture => self.capture_tick(callbacks),
        }
    }

    /// §4.4 "Slaved mode": driven by the master's own tick rather than this
    /// engine's timer.
    pub fn slaved_tick<H: HostCallbacks>(&mut self, callbacks: &mut H) -> Result<()> {
        let negotiated = self.negotiated()?;
        let threshold = self.threshold();
        let now_ns = self.timer.now_ns();
        let now_s = now_ns as f64 / NS_PER_SEC;

        let master = self.coordinator.master_record().ok_or_else(|| EngineError::illegal_state("slaved tick with no clock master registered"))?;
        let master_nsec = ((master.position + master.delay) as f64 * master.period_seconds() * NS_PER_SEC) as u64;

        let delay = match self.device.avail_delay()? {
            AvailOutcome::Ready { delay, .. } => delay,
            AvailOutcome::Xrun => return self.enter_recovering(),
        };

        let elapsed_s = threshold as f64 / negotiated.rate as f64;
        // Lock phase to the master's timeline rather than this engine's own
        // wall clock (spec leaves the exact slaved error term unspecified;
        // this mirrors the master-vs-local timestamp difference).
        let err = master_nsec as f64 / NS_PER_SEC - now_s;
        let dt = self.dll.update(err, elapsed_s);
        self.publish_clock(now_ns, negotiated.rate, delay, dt);

        if delay > 2 * threshold {
            self.device.rewind(threshold as usize)?;
        }

        match self.config.direction {
            Direction::Playback => {
                let write =
                    transfer::playback_write(&mut self.device, &mut self.pool, &self.io_slot, callbacks, negotiated.frame_size, 0, true, self.alsa_started)?;
                self.samples_produced += write.written as u64;
                self.alsa_started = write.started;
                if write.xrun {
                    self.enter_recovering()?;
                }
            }
            Direction::Capture => {
                let n = transfer::capture_push(&mut self.device, &mut self.pool, &self.io_slot, callbacks, threshold as usize, negotiated.frame_size, self.samples_produced)?;
                self.samples_produced += n as u64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferDescriptor, Chunk};
    use crate::device::mock::MockPcmDevice;
    use crate::device::{CommitOutcome, FormatRequest, SetFormatFlags};
    use crate::format::SampleFormat;
    use crate::timer::MockTimer;

    struct Recorder {
        ready_calls: Vec<IoStatus>,
        reuse_calls: Vec<u64>,
    }

    impl HostCallbacks for Recorder {
        fn ready(&mut self, status: IoStatus) {
            self.ready_calls.push(status);
        }
        fn reuse_buffer(&mut self, _port: u32, id: u64) {
            self.reuse_calls.push(id);
        }
    }

    fn engine(direction: Direction) -> Engine<MockPcmDevice, MockTimer> {
        let device = MockPcmDevice::new(direction).with_buffer_period(8192, 1024);
        let timer = MockTimer::new(0);
        let coordinator = Coordinator::new();
        let mut config = EngineConfig::default();
        config.direction = direction;
        config.min_latency = 1024;
        Engine::new(device, timer, coordinator, config)
    }

    fn pattern_descriptor(id: u64, frames: usize, frame_size: usize, seed: u8) -> BufferDescriptor {
        let mut d = BufferDescriptor::new(id, frames * frame_size, frame_size);
        for (i, b) in d.payload.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        d.chunk = Chunk { offset: 0, size: frames * frame_size };
        d
    }

    // Scenario 1: Playback startup.
    #[test]
    fn scenario_playback_startup_copies_two_descriptors_and_starts_device() {
        let mut e = engine(Direction::Playback);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.submit_buffer(pattern_descriptor(1, 1024, 4, 1));
        e.submit_buffer(pattern_descriptor(2, 1024, 4, 99));
        e.start().unwrap();

        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };
        e.device.set_avail_delay(0, 0);
        e.playback_tick(&mut rec).unwrap();
        assert!(e.device.is_started());
        assert_eq!(e.device.writes[0].offset_frames, 0);

        e.playback_tick(&mut rec).unwrap();
        assert_eq!(e.device.writes[1].offset_frames, 1024);
        assert_eq!(e.samples_produced(), 2048);
    }

    // Scenario 2: Playback underrun fill.
    #[test]
    fn scenario_playback_underrun_primes_silence_then_requests_buffer() {
        let mut e = engine(Direction::Playback);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.start().unwrap();
        e.device.set_avail_delay(0, 0);

        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };
        e.playback_tick(&mut rec).unwrap();
        assert!(e.device.is_started());
        assert_eq!(e.samples_produced(), 2 * 1024);

        e.playback_tick(&mut rec).unwrap();
        assert_eq!(rec.ready_calls, vec![IoStatus::NeedBuffer]);
    }

    // Scenario 3: Capture lag.
    #[test]
    fn scenario_capture_lag_transfers_exactly_threshold() {
        let mut e = engine(Direction::Capture);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.start().unwrap();
        e.submit_buffer(BufferDescriptor::new(5, 4096 * 4, 4));
        e.device.set_avail_delay(3 * 1024, 0);

        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };
        e.capture_tick(&mut rec).unwrap();
        assert_eq!(e.samples_produced(), 1024);
    }

    // Scenario 4: Xrun recovery.
    #[test]
    fn scenario_xrun_recovery_resets_dll_and_stays_started() {
        let mut e = engine(Direction::Playback);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.submit_buffer(pattern_descriptor(1, 1024, 4, 1));
        e.start().unwrap();
        e.device.set_avail_delay(0, 0);
        e.device.fail_next_commit();

        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };
        e.playback_tick(&mut rec).unwrap();
        assert_eq!(e.device.recover_calls, 1);
        assert_eq!(e.dll.bandwidth(), crate::dll::BW_MAX);
        assert!(matches!(e.state(), EngineState::Started(RunState::Running)));

        // engine keeps ticking afterward
        e.device.set_avail_delay(0, 0);
        assert!(e.playback_tick(&mut rec).is_ok());
    }

    // Scenario 5: Slaved tracking.
    #[test]
    fn scenario_slaved_tracking_converges_dt_toward_unity() {
        let coordinator = Coordinator::new();

        let master_device = MockPcmDevice::new(Direction::Playback).with_buffer_period(8192, 1024);
        let mut master = Engine::new(master_device, MockTimer::new(0), coordinator.clone(), {
            let mut c = EngineConfig::default();
            c.direction = Direction::Playback;
            c
        });
        master.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        coordinator.set_master(master.handle());

        let slave_device = MockPcmDevice::new(Direction::Capture).with_buffer_period(8192, 1024);
        let mut slave = Engine::new(slave_device, MockTimer::new(0), coordinator.clone(), {
            let mut c = EngineConfig::default();
            c.direction = Direction::Capture;
            c
        });
        slave.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        slave.set_slaved(true);
        slave.start().unwrap();
        slave.device.set_avail_delay(0, 0);

        let period = 1024.0 / 48_000.0;
        let mut dt = 1.0;
        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };
        let mut t_ns: u64 = 0;
        let ticks = ((3.0 / period) as u64) + 2;
        for i in 0..ticks {
            t_ns = (i as f64 * period * NS_PER_SEC) as u64;
            coordinator.publish(
                master.handle(),
                ClockRecord { nsec: t_ns, rate_hz: 48_000, position: (i * 1024) as i64, delay: 0, rate_diff: 1.0 },
            );
            slave.timer.advance_to(t_ns);
            slave.slaved_tick(&mut rec).unwrap();
            dt = slave.dll.dt();
        }
        let _ = t_ns;
        assert!((dt - 1.0).abs() < 0.05);
    }

    #[test]
    fn pause_is_idempotent_after_the_first_call() {
        let mut e = engine(Direction::Playback);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.start().unwrap();
        e.pause().unwrap();
        assert_eq!(e.state(), EngineState::Paused);
        e.pause().unwrap();
        assert_eq!(e.state(), EngineState::Paused);
    }

    #[test]
    fn set_format_outside_opened_or_configured_is_illegal_state() {
        let mut e = engine(Direction::Playback);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.start().unwrap();
        let result = e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 44_100, channels: 2 }, SetFormatFlags::Nearest);
        assert!(result.is_err());
    }

    #[test]
    fn enumerate_formats_honors_config_channel_map_gate() {
        let mut e = engine(Direction::Playback);
        assert!(e.enumerate_formats(None, crate::device::EnumCursor::default())[0].positions.is_some());

        let mut cfg = EngineConfig::default();
        cfg.direction = Direction::Playback;
        cfg.min_latency = 1024;
        cfg.enumerate_channel_maps = false;
        e = Engine::new(MockPcmDevice::new(Direction::Playback).with_buffer_period(8192, 1024), MockTimer::new(0), Coordinator::new(), cfg);
        assert!(e.enumerate_formats(None, crate::device::EnumCursor::default())[0].positions.is_none());
    }

    #[test]
    fn every_descriptor_ends_up_in_exactly_one_place() {
        let mut e = engine(Direction::Capture);
        e.set_format(&FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 }, SetFormatFlags::Nearest).unwrap();
        e.configure_buffers(vec![BufferDescriptor::new(1, 4096, 4), BufferDescriptor::new(2, 4096, 4)]);
        assert_eq!(e.pool.free_len() + e.pool.ready_len(), 2);
    }

    #[test]
    fn commit_outcome_xrun_variant_is_distinct_from_committed() {
        assert_ne!(CommitOutcome::Committed(10), CommitOutcome::Xrun);
    }
}
