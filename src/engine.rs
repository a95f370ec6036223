use crate::audio::SoundDevice;
use crate::project::{Arrangement, Project};
use crate::timing::TimeSource;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the control thread checks whether the song ended by itself.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub enum EngineCommand {
    LoadProject(PathBuf),
    ReloadProject(Project),
    SaveProject(PathBuf),
    PlaySong,
    PlayTrack(usize),
    Stop,
    SetTempo(u32),
    SetLoop(bool),
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    ProjectLoaded { project: Project },
    PlaybackState { playing: bool },
    Error { message: String },
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) {
        if self.command_tx.send(command).is_err() {
            tracing::warn!("engine thread is gone");
        }
    }

    /// Stops playback and waits for the control thread to exit.
    pub fn shutdown(mut self) {
        let (closed_tx, _) = crossbeam::channel::bounded(0);
        drop(std::mem::replace(&mut self.command_tx, closed_tx));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Runs the player on its own thread. It owns the live arrangement; the
/// caller talks to it only through commands and updates.
pub fn spawn_engine(device: Arc<dyn SoundDevice>, clock: Arc<dyn TimeSource>) -> EngineHandle {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let thread = std::thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || {
            let state = EngineState {
                device,
                clock,
                arrangement: None,
                looping: false,
                playing: false,
                update_tx,
            };
            engine_thread(command_rx, state);
        })
        .map_err(|e| tracing::error!(error = %e, "failed to spawn engine thread"))
        .ok();

    EngineHandle {
        command_tx,
        update_rx,
        thread,
    }
}

struct EngineState {
    device: Arc<dyn SoundDevice>,
    clock: Arc<dyn TimeSource>,
    arrangement: Option<Arrangement>,
    looping: bool,
    playing: bool,
    update_tx: Sender<EngineUpdate>,
}

fn engine_thread(command_rx: Receiver<EngineCommand>, mut state: EngineState) {
    loop {
        match command_rx.recv_timeout(POLL_INTERVAL) {
            Ok(command) => state.handle(command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        state.poll();
    }

    if let Some(arrangement) = state.arrangement.take() {
        arrangement.stop_all();
    }
    tracing::debug!("engine thread finished");
}

impl EngineState {
    fn send(&self, update: EngineUpdate) {
        let _ = self.update_tx.send(update);
    }

    fn report(&self, context: &str, error: impl std::fmt::Display) {
        let message = format!("{context}: {error}");
        tracing::warn!("{message}");
        self.send(EngineUpdate::Error { message });
    }

    fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
        self.send(EngineUpdate::PlaybackState { playing });
    }

    fn handle(&mut self, command: EngineCommand) {
        tracing::debug!(?command, "engine command");
        match command {
            EngineCommand::LoadProject(path) => match Project::load(&path) {
                Ok(project) => {
                    tracing::info!(path = %path.display(), "project loaded");
                    self.install(project);
                }
                Err(e) => self.report("Failed to load project", e),
            },

            EngineCommand::ReloadProject(project) => self.install(project),

            EngineCommand::SaveProject(path) => match &self.arrangement {
                Some(arrangement) => match Project::capture(arrangement).save(&path) {
                    Ok(()) => tracing::info!(path = %path.display(), "project saved"),
                    Err(e) => self.report("Failed to save project", e),
                },
                None => self.report("Failed to save project", "nothing loaded"),
            },

            EngineCommand::PlaySong => {
                if let Some(arrangement) = &self.arrangement {
                    arrangement.play_song();
                    self.set_playing(true);
                }
            }

            EngineCommand::PlayTrack(index) => {
                let Some(arrangement) = &self.arrangement else {
                    return;
                };
                match arrangement.play_track(index) {
                    Ok(()) => self.set_playing(true),
                    Err(e) => self.report("Failed to play track", e),
                }
            }

            EngineCommand::Stop => {
                if let Some(arrangement) = &self.arrangement {
                    arrangement.stop_all();
                }
                self.set_playing(false);
            }

            EngineCommand::SetTempo(bpm) => {
                if let Some(arrangement) = &mut self.arrangement {
                    if let Err(e) = arrangement.set_tempo(bpm) {
                        self.report("Failed to set tempo", e);
                    }
                }
            }

            EngineCommand::SetLoop(looping) => {
                self.looping = looping;
                if let Some(arrangement) = &self.arrangement {
                    arrangement.set_loop(looping);
                }
            }
        }
    }

    /// Swaps in a freshly built arrangement. A project that fails to build
    /// leaves the current one playing untouched.
    fn install(&mut self, project: Project) {
        // Saving rewrites the watched file; that echo is not a change.
        if self
            .arrangement
            .as_ref()
            .is_some_and(|current| Project::capture(current) == project)
        {
            tracing::debug!("project unchanged");
            return;
        }

        let arrangement = match project.build(self.device.clone(), self.clock.clone()) {
            Ok(arrangement) => arrangement,
            Err(e) => {
                self.report("Failed to load project", e);
                return;
            }
        };

        let resume = self.playing;
        if let Some(previous) = self.arrangement.take() {
            previous.stop_all();
        }

        arrangement.set_loop(self.looping);
        arrangement.apply_channel_settings();
        self.send(EngineUpdate::ProjectLoaded { project });

        if resume {
            arrangement.play_song();
        }
        self.arrangement = Some(arrangement);
    }

    fn poll(&mut self) {
        let finished = self.playing
            && self
                .arrangement
                .as_ref()
                .is_none_or(|arrangement| !arrangement.is_playing());
        if finished {
            tracing::debug!("playback finished");
            self.set_playing(false);
        }
    }
}
