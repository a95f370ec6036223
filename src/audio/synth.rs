use std::sync::Arc;

use arc_swap::ArcSwap;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};

use super::{
    CHANNEL_COUNT, ChannelConfig, ChannelVoices, DeviceError, Instrument, NOTE_VELOCITY,
    SoundDevice, clamp_bend, clamp_volume, midi_channel, midi_pitch,
};
use crate::events::Channel;

const MASTER_GAIN: f32 = 0.2;
const QUEUE_CAPACITY: usize = 4096;
/// Full bend range in semitones either way.
const BEND_RANGE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum VoiceCommand {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    AllNotesOff,
}

/// Built-in software synthesizer on the default cpal output.
///
/// Note commands travel to the audio callback through a lock-free ring
/// buffer; channel settings are swapped in whole through an `ArcSwap`.
/// The stream lives on its own thread and stops when the device drops.
pub struct SynthDevice {
    producer: Mutex<HeapProd<VoiceCommand>>,
    channels: Arc<ArcSwap<Vec<ChannelConfig>>>,
    presets: Vec<Instrument>,
    sample_rate: u32,
    _shutdown: Sender<()>,
}

struct RenderState {
    voices: Vec<ChannelVoices>,
    consumer: HeapCons<VoiceCommand>,
    channels: Arc<ArcSwap<Vec<ChannelConfig>>>,
    sample_rate: f32,
    num_channels: usize,
}

impl SynthDevice {
    /// Opens the default output device. `sample_rate` overrides the
    /// device's default rate.
    pub fn open(sample_rate: Option<u32>) -> Result<Self, DeviceError> {
        let presets = Instrument::presets();
        let channels = Arc::new(ArcSwap::from_pointee(vec![
            ChannelConfig::new(presets[0].clone());
            CHANNEL_COUNT
        ]));

        let (producer, consumer) = HeapRb::<VoiceCommand>::new(QUEUE_CAPACITY).split();
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);

        let render = RenderState {
            voices: (0..CHANNEL_COUNT).map(|_| ChannelVoices::new()).collect(),
            consumer,
            channels: channels.clone(),
            sample_rate: 0.0,
            num_channels: 0,
        };

        std::thread::Builder::new()
            .name("synth-output".to_string())
            .spawn(move || stream_thread(render, sample_rate, ready_tx, shutdown_rx))
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| DeviceError::Unavailable("audio thread exited".to_string()))??;

        Ok(Self {
            producer: Mutex::new(producer),
            channels,
            presets,
            sample_rate,
            _shutdown: shutdown_tx,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn push(&self, command: VoiceCommand) -> Result<(), DeviceError> {
        self.producer
            .lock()
            .try_push(command)
            .map_err(|_| DeviceError::Backend("voice queue full".to_string()))
    }

    fn update_channel(&self, channel: u8, update: impl Fn(&mut ChannelConfig)) {
        self.channels.rcu(|current| {
            let mut next = (**current).clone();
            update(&mut next[channel as usize]);
            next
        });
    }
}

fn stream_thread(
    render: RenderState,
    sample_rate: Option<u32>,
    ready_tx: Sender<Result<u32, DeviceError>>,
    shutdown_rx: Receiver<()>,
) {
    match build_stream(render, sample_rate) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            // Returns once the device's sender is dropped.
            let _ = shutdown_rx.recv();
            drop(stream);
            tracing::debug!("synth output closed");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn build_stream(
    mut render: RenderState,
    sample_rate: Option<u32>,
) -> Result<(cpal::Stream, u32), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::Unavailable("no output device".to_string()))?;
    let config = device
        .default_output_config()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    let mut stream_config: cpal::StreamConfig = config.into();
    if let Some(rate) = sample_rate {
        stream_config.sample_rate = rate;
    }

    let rate = stream_config.sample_rate;
    render.sample_rate = rate as f32;
    render.num_channels = stream_config.channels as usize;
    tracing::info!(
        channels = render.num_channels,
        sample_rate = rate,
        "audio output"
    );

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render.fill(data),
            |err| tracing::error!(error = %err, "audio stream error"),
            None,
        )
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    Ok((stream, rate))
}

impl RenderState {
    fn apply(&mut self, command: VoiceCommand, configs: &[ChannelConfig]) {
        match command {
            VoiceCommand::NoteOn {
                channel,
                pitch,
                velocity,
            } => {
                let ch = channel as usize;
                self.voices[ch].note_on(pitch, velocity, &configs[ch]);
            }
            VoiceCommand::NoteOff { channel, pitch } => {
                self.voices[channel as usize].note_off(pitch);
            }
            VoiceCommand::AllNotesOff => {
                self.voices.iter_mut().for_each(ChannelVoices::release_all);
            }
        }
    }

    fn fill(&mut self, data: &mut [f32]) {
        let configs = self.channels.load();
        while let Some(command) = self.consumer.try_pop() {
            self.apply(command, &configs);
        }

        let num_channels = self.num_channels.max(1);
        for frame in data.chunks_mut(num_channels) {
            let mut sample = 0.0;
            for (voices, config) in self.voices.iter_mut().zip(configs.iter()) {
                sample += voices.render_sample(config, self.sample_rate);
            }
            frame.fill((sample * MASTER_GAIN).clamp(-1.0, 1.0));
        }
    }
}

impl SoundDevice for SynthDevice {
    fn name(&self) -> &str {
        "synth"
    }

    fn note_on(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError> {
        self.push(VoiceCommand::NoteOn {
            channel: midi_channel(channel)?,
            pitch: midi_pitch(pitch)?,
            velocity: NOTE_VELOCITY,
        })
    }

    fn note_off(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError> {
        self.push(VoiceCommand::NoteOff {
            channel: midi_channel(channel)?,
            pitch: midi_pitch(pitch)?,
        })
    }

    fn set_volume(&self, channel: Channel, volume: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        let volume = clamp_volume(volume) as f32 / 127.0;
        self.update_channel(ch, |c| c.volume = volume);
        Ok(())
    }

    fn set_instrument(&self, channel: Channel, instrument: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        let preset = usize::try_from(instrument)
            .ok()
            .and_then(|i| self.presets.get(i))
            .ok_or(DeviceError::ValueOutOfRange {
                what: "instrument",
                value: instrument,
            })?;
        self.update_channel(ch, |c| c.instrument = preset.clone());
        Ok(())
    }

    fn set_pitch_bend(&self, channel: Channel, amount: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        let semitones = clamp_bend(amount) as f32 / 8192.0 * BEND_RANGE;
        self.update_channel(ch, |c| c.bend_semitones = semitones);
        Ok(())
    }

    fn set_mute(&self, channel: Channel, mute: bool) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        self.update_channel(ch, |c| c.muted = mute);
        Ok(())
    }

    fn all_notes_off(&self) -> Result<(), DeviceError> {
        self.push(VoiceCommand::AllNotesOff)
    }

    fn instrument_names(&self) -> Vec<String> {
        self.presets.iter().map(|p| p.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_state() -> (HeapProd<VoiceCommand>, RenderState) {
        let presets = Instrument::presets();
        let channels = Arc::new(ArcSwap::from_pointee(vec![
            ChannelConfig::new(presets[1].clone());
            CHANNEL_COUNT
        ]));
        let (producer, consumer) = HeapRb::<VoiceCommand>::new(16).split();
        let state = RenderState {
            voices: (0..CHANNEL_COUNT).map(|_| ChannelVoices::new()).collect(),
            consumer,
            channels,
            sample_rate: 44_100.0,
            num_channels: 2,
        };
        (producer, state)
    }

    #[test]
    fn queued_notes_reach_the_callback() {
        let (mut producer, mut state) = render_state();
        let mut buffer = vec![0.0; 1024];
        state.fill(&mut buffer);
        assert!(buffer.iter().all(|s| *s == 0.0));

        producer
            .try_push(VoiceCommand::NoteOn {
                channel: 3,
                pitch: 69,
                velocity: 100,
            })
            .unwrap();
        state.fill(&mut buffer);
        assert_eq!(state.voices[3].active_count(), 1);
        assert!(buffer.iter().any(|s| *s != 0.0));
        for frame in buffer.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn all_notes_off_releases_every_channel() {
        let (mut producer, mut state) = render_state();
        for channel in 0..4 {
            producer
                .try_push(VoiceCommand::NoteOn {
                    channel,
                    pitch: 60,
                    velocity: 100,
                })
                .unwrap();
        }
        producer.try_push(VoiceCommand::AllNotesOff).unwrap();

        let mut buffer = vec![0.0; 2 * 44_100];
        state.fill(&mut buffer);
        assert!(state.voices.iter().all(|v| v.active_count() == 0));
    }

    #[test]
    fn channel_updates_are_seen_on_the_next_buffer() {
        let (mut producer, mut state) = render_state();
        state.channels.rcu(|current| {
            let mut next = (**current).clone();
            next[0].muted = true;
            next
        });
        producer
            .try_push(VoiceCommand::NoteOn {
                channel: 0,
                pitch: 60,
                velocity: 100,
            })
            .unwrap();
        let mut buffer = vec![0.0; 512];
        state.fill(&mut buffer);
        assert!(buffer.iter().all(|s| *s == 0.0));
    }
}
