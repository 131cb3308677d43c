//! The audio conference bridge: an N-to-M mixer driven by a single
//! clock.
//!
//! Every tick, under one lock: pull a frame from each port that has
//! listeners, adjust and measure its level, mix it into each
//! listener's accumulation buffer in the unsigned 16-bit domain, then
//! flush every port's mix, converting rate and frame size per port
//! where needed.
//!
//! TX/RX are seen from the bridge: TX is bridge-to-port, RX is
//! port-to-bridge. The "transmits-to" relation is asymmetric; a
//! bidirectional conversation needs two edges.
//!
//! Slot 0 is the master (sound device) port. Its capture side writes
//! into a small ring so that device callbacks arriving in bursts do
//! not race the mix clock; a read/write collision resets the reader
//! to half a ring behind the writer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::level::{
    NORMAL_LEVEL, adjust_and_measure, avg_signal, level_from_avg, pcm_to_unsigned,
    unsigned_to_pcm,
};
use crate::port::MediaPort;
use crate::resample::{ResampleQuality, Resampler};
use crate::types::{AudioFrame, PortHandle, PortInfo, PortOp, Sample};

/// Depth of the master capture ring.
pub const RX_BUF_COUNT: usize = 8;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub clock_rate: u32,
    pub samples_per_frame: usize,
    pub max_ports: usize,
    /// Resampler choice for ports whose rate differs from the bridge.
    pub quality: ResampleQuality,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            clock_rate: 16_000,
            samples_per_frame: 320,
            max_ports: 32,
            quality: ResampleQuality::SmallFilter,
        }
    }
}

struct ConfPort {
    name: String,
    /// None for the master slot.
    port: Option<Box<dyn MediaPort>>,
    rx_setting: PortOp,
    tx_setting: PortOp,
    clock_rate: u32,
    samples_per_frame: usize,
    /// 0..=255, 128 = unity.
    rx_adj_level: u32,
    tx_adj_level: u32,
    rx_resample: Option<Resampler>,
    tx_resample: Option<Resampler>,
    /// RX accumulation when rate or frame size differ.
    rx_buf: Vec<Sample>,
    needs_rx_buf: bool,
    tx_buf: Vec<Sample>,
    /// Unsigned 32-bit mix accumulator, bridge frame sized.
    mix_buf: Vec<u32>,
    /// Sum of source levels mixed in this tick; the divisor.
    sources: u32,
    /// listeners[slot] = true when this port transmits to `slot`.
    listeners: Vec<bool>,
    listener_cnt: usize,
    transmitter_cnt: usize,
    rx_level: u8,
    tx_level: u8,
    generation: u64,
    // Master slot only.
    snd_bufs: Option<Vec<Vec<Sample>>>,
    snd_write_pos: usize,
    snd_read_pos: usize,
}

impl ConfPort {
    fn handle(&self, slot: usize) -> PortHandle {
        PortHandle { slot, generation: self.generation }
    }
}

struct BridgeInner {
    ports: Vec<Option<ConfPort>>,
    port_cnt: usize,
    connect_cnt: usize,
    next_generation: u64,
    timestamp: u64,
}

/// The conference bridge. All mutation and the tick serialize on one
/// mutex, so no port change is ever visible half-done to a tick.
pub struct ConfBridge {
    config: BridgeConfig,
    inner: Mutex<BridgeInner>,
}

impl ConfBridge {
    pub fn new(config: BridgeConfig) -> Arc<ConfBridge> {
        let mut ports: Vec<Option<ConfPort>> = Vec::with_capacity(config.max_ports);
        ports.resize_with(config.max_ports, || None);

        let master = ConfPort {
            name: "Master/sound".to_string(),
            port: None,
            rx_setting: PortOp::Enabled,
            tx_setting: PortOp::Enabled,
            clock_rate: config.clock_rate,
            samples_per_frame: config.samples_per_frame,
            rx_adj_level: NORMAL_LEVEL,
            tx_adj_level: NORMAL_LEVEL,
            rx_resample: None,
            tx_resample: None,
            rx_buf: Vec::new(),
            needs_rx_buf: false,
            tx_buf: Vec::new(),
            mix_buf: vec![0; config.samples_per_frame],
            sources: 0,
            listeners: vec![false; config.max_ports],
            listener_cnt: 0,
            transmitter_cnt: 0,
            rx_level: 0,
            tx_level: 0,
            generation: 0,
            snd_bufs: Some(vec![vec![0; config.samples_per_frame]; RX_BUF_COUNT]),
            snd_write_pos: 0,
            snd_read_pos: 0,
        };
        ports[0] = Some(master);

        info!(
            clock_rate = config.clock_rate,
            samples_per_frame = config.samples_per_frame,
            max_ports = config.max_ports,
            "conference bridge created"
        );
        Arc::new(ConfBridge {
            config,
            inner: Mutex::new(BridgeInner {
                ports,
                port_cnt: 1,
                connect_cnt: 0,
                next_generation: 1,
                timestamp: 0,
            }),
        })
    }

    /// The master port's handle (slot 0).
    pub fn master_handle(&self) -> PortHandle {
        PortHandle { slot: 0, generation: 0 }
    }

    /// Attach a media port; resamplers are chosen here, once, when
    /// the port's rate differs from the bridge's.
    pub fn add_port(&self, port: Box<dyn MediaPort>) -> Result<PortHandle> {
        let mut inner = self.inner.lock();
        let slot = inner.ports.iter().position(Option::is_none).ok_or(Error::TooManyPorts)?;

        let clock_rate = port.clock_rate();
        let samples_per_frame = port.samples_per_frame();
        let name = port.name().to_string();

        let (rx_resample, tx_resample) = if clock_rate != self.config.clock_rate {
            (
                Some(Resampler::new(clock_rate, self.config.clock_rate, self.config.quality)?),
                Some(Resampler::new(self.config.clock_rate, clock_rate, self.config.quality)?),
            )
        } else {
            (None, None)
        };
        let needs_rx_buf = clock_rate != self.config.clock_rate
            || samples_per_frame != self.config.samples_per_frame;

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let conf_port = ConfPort {
            name: name.clone(),
            port: Some(port),
            rx_setting: PortOp::Enabled,
            tx_setting: PortOp::Enabled,
            clock_rate,
            samples_per_frame,
            rx_adj_level: NORMAL_LEVEL,
            tx_adj_level: NORMAL_LEVEL,
            rx_resample,
            tx_resample,
            rx_buf: Vec::new(),
            needs_rx_buf,
            tx_buf: Vec::new(),
            mix_buf: vec![0; self.config.samples_per_frame],
            sources: 0,
            listeners: vec![false; self.config.max_ports],
            listener_cnt: 0,
            transmitter_cnt: 0,
            rx_level: 0,
            tx_level: 0,
            generation,
            snd_bufs: None,
            snd_write_pos: 0,
            snd_read_pos: 0,
        };
        let handle = conf_port.handle(slot);
        inner.ports[slot] = Some(conf_port);
        inner.port_cnt += 1;
        debug!(%handle, name, clock_rate, "port added");
        Ok(handle)
    }

    /// Remove a port; every edge in and out of it goes too.
    pub fn remove_port(&self, handle: PortHandle) -> Result<()> {
        if handle.slot == 0 {
            return Err(Error::InvalidOperation("master port cannot be removed".to_string()));
        }
        let mut inner = self.inner.lock();
        inner.check(handle)?;

        // Edges out of the removed port.
        let removed_out = {
            let port = inner.ports[handle.slot].as_mut().unwrap();
            let cnt = port.listener_cnt;
            let listeners = std::mem::take(&mut port.listeners);
            for (sink, is_listener) in listeners.iter().enumerate() {
                if *is_listener {
                    if let Some(Some(sink_port)) = inner.ports.get_mut(sink) {
                        sink_port.transmitter_cnt = sink_port.transmitter_cnt.saturating_sub(1);
                    }
                }
            }
            cnt
        };
        // Edges into the removed port.
        let mut removed_in = 0;
        for slot in 0..inner.ports.len() {
            if slot == handle.slot {
                continue;
            }
            if let Some(port) = inner.ports[slot].as_mut() {
                if port.listeners[handle.slot] {
                    port.listeners[handle.slot] = false;
                    port.listener_cnt -= 1;
                    removed_in += 1;
                }
            }
        }
        inner.connect_cnt = inner.connect_cnt.saturating_sub(removed_out + removed_in);
        inner.ports[handle.slot] = None;
        inner.port_cnt -= 1;
        debug!(%handle, "port removed");
        Ok(())
    }

    /// Let `src` transmit to `sink`. The reverse direction needs its
    /// own call.
    pub fn connect(&self, src: PortHandle, sink: PortHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(src)?;
        inner.check(sink)?;
        if src.slot == sink.slot {
            return Err(Error::InvalidOperation("port cannot listen to itself".to_string()));
        }
        {
            let src_port = inner.ports[src.slot].as_mut().unwrap();
            if src_port.listeners[sink.slot] {
                return Ok(());
            }
            src_port.listeners[sink.slot] = true;
            src_port.listener_cnt += 1;
        }
        inner.ports[sink.slot].as_mut().unwrap().transmitter_cnt += 1;
        inner.connect_cnt += 1;
        debug!(%src, %sink, connect_cnt = inner.connect_cnt, "ports connected");
        Ok(())
    }

    /// Stop `src` transmitting to `sink`.
    pub fn disconnect(&self, src: PortHandle, sink: PortHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(src)?;
        inner.check(sink)?;
        {
            let src_port = inner.ports[src.slot].as_mut().unwrap();
            if !src_port.listeners[sink.slot] {
                return Ok(());
            }
            src_port.listeners[sink.slot] = false;
            src_port.listener_cnt -= 1;
        }
        inner.ports[sink.slot].as_mut().unwrap().transmitter_cnt -= 1;
        inner.connect_cnt = inner.connect_cnt.saturating_sub(1);
        debug!(%src, %sink, "ports disconnected");
        Ok(())
    }

    /// RX gain, -128..=127 around unity.
    pub fn adjust_rx_level(&self, handle: PortHandle, adj: i32) -> Result<()> {
        if !(-128..=127).contains(&adj) {
            return Err(Error::LevelOutOfRange(adj));
        }
        let mut inner = self.inner.lock();
        inner.check(handle)?;
        inner.ports[handle.slot].as_mut().unwrap().rx_adj_level =
            (adj + NORMAL_LEVEL as i32) as u32;
        Ok(())
    }

    /// TX gain, -128..=127 around unity.
    pub fn adjust_tx_level(&self, handle: PortHandle, adj: i32) -> Result<()> {
        if !(-128..=127).contains(&adj) {
            return Err(Error::LevelOutOfRange(adj));
        }
        let mut inner = self.inner.lock();
        inner.check(handle)?;
        inner.ports[handle.slot].as_mut().unwrap().tx_adj_level =
            (adj + NORMAL_LEVEL as i32) as u32;
        Ok(())
    }

    /// Last computed (tx, rx) levels of a port, µ-law complement.
    pub fn signal_levels(&self, handle: PortHandle) -> Result<(u8, u8)> {
        let inner = self.inner.lock();
        inner.check(handle)?;
        let port = inner.ports[handle.slot].as_ref().unwrap();
        Ok((port.tx_level, port.rx_level))
    }

    pub fn set_rx_setting(&self, handle: PortHandle, op: PortOp) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(handle)?;
        inner.ports[handle.slot].as_mut().unwrap().rx_setting = op;
        Ok(())
    }

    pub fn set_tx_setting(&self, handle: PortHandle, op: PortOp) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(handle)?;
        inner.ports[handle.slot].as_mut().unwrap().tx_setting = op;
        Ok(())
    }

    pub fn port_info(&self, handle: PortHandle) -> Result<PortInfo> {
        let inner = self.inner.lock();
        inner.check(handle)?;
        Ok(inner.describe(handle.slot))
    }

    /// Snapshot of every live port.
    pub fn ports_info(&self) -> Vec<PortInfo> {
        let inner = self.inner.lock();
        (0..inner.ports.len()).filter(|s| inner.ports[*s].is_some()).map(|s| inner.describe(s)).collect()
    }

    pub fn port_count(&self) -> usize {
        self.inner.lock().port_cnt
    }

    /// Number of directed edges. The sound flow auto start/stop logic
    /// upstairs watches this.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().connect_cnt
    }

    /// Device capture callback: write one frame into the master ring.
    pub fn master_capture(&self, samples: &[Sample]) {
        let mut inner = self.inner.lock();
        let spf = self.config.samples_per_frame;
        let master = inner.ports[0].as_mut().unwrap();
        let write_pos = master.snd_write_pos;
        if let Some(bufs) = master.snd_bufs.as_mut() {
            let buf = &mut bufs[write_pos];
            let n = samples.len().min(spf);
            buf[..n].copy_from_slice(&samples[..n]);
            for value in buf[n..].iter_mut() {
                *value = 0;
            }
        }
        master.snd_write_pos = (write_pos + 1) % RX_BUF_COUNT;
    }

    /// One clock tick: mix everything, flush everything, return the
    /// master playback frame.
    pub fn tick(&self) -> Vec<Sample> {
        let mut inner = self.inner.lock();
        let spf = self.config.samples_per_frame;
        let timestamp = inner.timestamp;
        inner.timestamp += spf as u64;

        // Reset accumulators.
        for port in inner.ports.iter_mut().flatten() {
            port.sources = 0;
            port.mix_buf.iter_mut().for_each(|v| *v = 0);
        }

        // RX phase: gather and mix.
        let slot_count = inner.ports.len();
        for slot in 0..slot_count {
            let Some(port) = inner.ports[slot].as_mut() else { continue };
            if port.rx_setting != PortOp::Enabled {
                port.rx_level = 0;
                continue;
            }
            // A port nobody listens to is not even polled.
            if port.listener_cnt == 0 {
                port.rx_level = 0;
                continue;
            }

            let mut frame = vec![0i16; spf];
            if slot == 0 {
                // Capture ring; on collision jump back half a ring.
                if port.snd_read_pos == port.snd_write_pos {
                    port.snd_read_pos =
                        (port.snd_write_pos + RX_BUF_COUNT - RX_BUF_COUNT / 2) % RX_BUF_COUNT;
                }
                if let Some(bufs) = port.snd_bufs.as_ref() {
                    frame.copy_from_slice(&bufs[port.snd_read_pos]);
                }
                port.snd_read_pos = (port.snd_read_pos + 1) % RX_BUF_COUNT;
            } else if let Err(e) = read_port(&self.config, port, &mut frame, timestamp) {
                trace!(slot, error = %e, "get_frame failed, skipping port this tick");
                port.rx_level = 0;
                continue;
            }

            // Level adjust and measurement in one pass.
            let avg = if port.rx_adj_level != NORMAL_LEVEL {
                adjust_and_measure(&mut frame, port.rx_adj_level)
            } else {
                avg_signal(&frame)
            };
            let level = level_from_avg(avg) as u32;
            port.rx_level = level as u8;

            // Into the unsigned mixing domain.
            let uns: Vec<u32> = frame.iter().map(|s| pcm_to_unsigned(*s) as u32).collect();
            let listeners = port.listeners.clone();

            for (sink, is_listener) in listeners.iter().enumerate() {
                if !*is_listener {
                    continue;
                }
                let Some(listener) = inner.ports[sink].as_mut() else { continue };
                if listener.tx_setting != PortOp::Enabled {
                    continue;
                }
                for (acc, value) in listener.mix_buf.iter_mut().zip(uns.iter()) {
                    *acc += value * level;
                }
                listener.sources += level;
            }
        }

        // TX phase: flush every port's mix.
        for slot in 0..slot_count {
            let Some(port) = inner.ports[slot].as_mut() else { continue };
            if let Err(e) = write_port(&self.config, port, timestamp, slot == 0) {
                trace!(slot, error = %e, "put_frame failed");
            }
        }

        // Master playback: the mixed signal for the sound device.
        let master = inner.ports[0].as_ref().unwrap();
        if master.sources > 0 {
            let sources = master.sources;
            master.mix_buf.iter().map(|v| unsigned_to_pcm(*v / sources)).collect()
        } else {
            vec![0; spf]
        }
    }

    /// Drive the bridge from a tokio interval, publishing master
    /// playback frames. Stands in for the sound-device callback
    /// thread.
    pub fn start_clock(self: &Arc<Self>) -> mpsc::Receiver<Vec<Sample>> {
        let (tx, rx) = mpsc::channel(RX_BUF_COUNT);
        let bridge = self.clone();
        let period = Duration::from_millis(
            (self.config.samples_per_frame as u64 * 1000) / self.config.clock_rate as u64,
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let playback = bridge.tick();
                if tx.send(playback).await.is_err() {
                    break;
                }
            }
            debug!("bridge clock stopped");
        });
        rx
    }
}

impl BridgeInner {
    fn check(&self, handle: PortHandle) -> Result<()> {
        match self.ports.get(handle.slot).and_then(Option::as_ref) {
            Some(port) if port.generation == handle.generation => Ok(()),
            _ => Err(Error::InvalidSlot(handle.slot)),
        }
    }

    fn describe(&self, slot: usize) -> PortInfo {
        let port = self.ports[slot].as_ref().unwrap();
        PortInfo {
            handle: port.handle(slot),
            name: port.name.clone(),
            clock_rate: port.clock_rate,
            samples_per_frame: port.samples_per_frame,
            rx_setting: port.rx_setting,
            tx_setting: port.tx_setting,
            rx_adj_level: port.rx_adj_level as i32 - NORMAL_LEVEL as i32,
            tx_adj_level: port.tx_adj_level as i32 - NORMAL_LEVEL as i32,
            listener_cnt: port.listener_cnt,
            transmitter_cnt: port.transmitter_cnt,
        }
    }
}

/// Pull one bridge-sized frame out of a port, resampling and
/// re-framing through the RX accumulation buffer when the port's
/// format differs.
fn read_port(
    config: &BridgeConfig,
    port: &mut ConfPort,
    out: &mut [Sample],
    timestamp: u64,
) -> Result<()> {
    let media = port.port.as_mut().expect("non-master port has a media port");

    if !port.needs_rx_buf {
        let frame = media.get_frame(timestamp)?;
        if frame.is_audio() {
            let n = frame.samples.len().min(out.len());
            out[..n].copy_from_slice(&frame.samples[..n]);
            for value in out[n..].iter_mut() {
                *value = 0;
            }
        } else {
            out.iter_mut().for_each(|v| *v = 0);
        }
        return Ok(());
    }

    // Samples of port audio consumed per bridge frame.
    let src_needed =
        config.samples_per_frame * port.clock_rate as usize / config.clock_rate as usize;
    while port.rx_buf.len() < src_needed {
        let frame = media.get_frame(timestamp)?;
        if frame.is_audio() {
            port.rx_buf.extend_from_slice(&frame.samples);
            // Short frames zero-fill to keep the cadence.
            if frame.samples.len() < port.samples_per_frame {
                port.rx_buf
                    .extend(std::iter::repeat(0).take(port.samples_per_frame - frame.samples.len()));
            }
        } else {
            port.rx_buf.extend(std::iter::repeat(0).take(port.samples_per_frame));
        }
    }

    if let Some(resampler) = port.rx_resample.as_mut() {
        resampler.run(&port.rx_buf[..src_needed], out)?;
    } else {
        out.copy_from_slice(&port.rx_buf[..src_needed]);
    }
    port.rx_buf.drain(..src_needed);
    Ok(())
}

/// Deliver the mixed signal to one port: divide by `sources`, convert
/// back to signed PCM, adjust, and either hand the frame over
/// directly or push it through the TX re-framing buffer.
fn write_port(
    config: &BridgeConfig,
    port: &mut ConfPort,
    timestamp: u64,
    is_master: bool,
) -> Result<()> {
    // A disabled direction moves nothing at all.
    if port.tx_setting == PortOp::Disabled {
        port.tx_level = 0;
        return Ok(());
    }
    // A muted sink, or one with no sources this tick, gets a typed
    // no-audio frame so RTP DTX keeps working downstream.
    if port.tx_setting == PortOp::Muted || port.sources == 0 {
        port.tx_level = 0;
        if let Some(media) = port.port.as_mut() {
            media.put_frame(&AudioFrame::no_audio(timestamp))?;
        }
        return Ok(());
    }

    let sources = port.sources;
    let mut buf: Vec<Sample> =
        port.mix_buf.iter().map(|v| unsigned_to_pcm(*v / sources)).collect();

    // Measured before put_frame on purpose: this is the level of the
    // mixed signal, not of the frame the port finally consumes.
    let avg = if port.tx_adj_level != NORMAL_LEVEL {
        adjust_and_measure(&mut buf, port.tx_adj_level)
    } else {
        avg_signal(&buf)
    };
    port.tx_level = level_from_avg(avg);

    if is_master {
        // The caller collects the playback frame from mix_buf.
        return Ok(());
    }
    let media = port.port.as_mut().expect("non-master port has a media port");

    if port.clock_rate == config.clock_rate
        && port.samples_per_frame == config.samples_per_frame
    {
        return media.put_frame(&AudioFrame::audio(buf, timestamp));
    }

    // Re-frame (and resample) through the TX accumulation buffer.
    if let Some(resampler) = port.tx_resample.as_mut() {
        let dst_count =
            config.samples_per_frame * port.clock_rate as usize / config.clock_rate as usize;
        let mut converted = vec![0i16; dst_count];
        resampler.run(&buf, &mut converted)?;
        port.tx_buf.extend_from_slice(&converted);
    } else {
        port.tx_buf.extend_from_slice(&buf);
    }
    while port.tx_buf.len() >= port.samples_per_frame {
        let chunk: Vec<Sample> = port.tx_buf.drain(..port.samples_per_frame).collect();
        media.put_frame(&AudioFrame::audio(chunk, timestamp))?;
    }
    Ok(())
}
