use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing_subscriber::EnvFilter;

use sketchseq::audio::MidiDevice;
use sketchseq::config::USAGE;
use sketchseq::{
    CliArgs, EngineCommand, EngineHandle, EngineUpdate, Project, RecordingDevice, Settings,
    SoundDevice, WallClock, open_device, spawn_engine,
};

const DEFAULT_SONG: &str = "song.txt";
const TEMPO_STEP: u32 = 5;

const KEYS: &str = "space play/stop   0-9 play track   l loop   +/- tempo   s save   q quit";

/// Stderr with `\r\n` line ends, for logging while the terminal is raw.
struct RawModeStderr(io::Stderr);

impl Write for RawModeStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut lines = buf.split(|b| *b == b'\n');
        if let Some(first) = lines.next() {
            self.0.write_all(first)?;
        }
        for line in lines {
            self.0.write_all(b"\r\n")?;
            self.0.write_all(line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn init_logging(default_filter: &str, raw_terminal: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if raw_terminal {
        builder
            .with_writer(|| RawModeStderr(io::stderr()))
            .init();
    } else {
        builder.with_writer(io::stderr).init();
    }
}

fn main() -> ExitCode {
    let cli = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    if cli.help {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    if cli.list_ports {
        for port in MidiDevice::available_ports() {
            println!("{port}");
        }
        return ExitCode::SUCCESS;
    }

    let config_path = Settings::locate(cli.config.as_deref());
    let mut settings = match Settings::load_or_default(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut settings);

    init_logging(&settings.log_filter, !cli.once);

    let device: Arc<dyn SoundDevice> = if cli.dry_run {
        Arc::new(RecordingDevice::echoing())
    } else {
        open_device(&settings)
    };

    let song_path = cli
        .song
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SONG));
    let engine = spawn_engine(device, Arc::new(WallClock::new()));

    if song_path.exists() {
        engine.send(EngineCommand::LoadProject(song_path.clone()));
    } else {
        tracing::info!(path = %song_path.display(), "no song file yet, starting empty");
        engine.send(EngineCommand::ReloadProject(Project::new(settings.tempo_bpm)));
    }
    engine.send(EngineCommand::SetLoop(settings.loop_playback && !cli.once));
    if let Some(bpm) = cli.tempo_bpm {
        engine.send(EngineCommand::SetTempo(bpm));
    }

    let result = if cli.once {
        play_once(&engine)
    } else {
        run_interactive(&engine, &settings, &song_path, cli.tempo_bpm)
    };
    engine.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn play_once(engine: &EngineHandle) -> Result<(), Box<dyn Error>> {
    let mut started = false;
    loop {
        match engine.update_rx.recv()? {
            EngineUpdate::ProjectLoaded { .. } if !started => {
                started = true;
                engine.send(EngineCommand::PlaySong);
            }
            EngineUpdate::ProjectLoaded { .. } => {}
            EngineUpdate::Error { message } if !started => return Err(message.into()),
            EngineUpdate::Error { message } => tracing::warn!("{message}"),
            EngineUpdate::PlaybackState { playing: false } if started => return Ok(()),
            EngineUpdate::PlaybackState { .. } => {}
        }
    }
}

fn watch_song(commands: Sender<EngineCommand>, path: &Path) -> Option<RecommendedWatcher> {
    let watched = path.to_path_buf();
    let watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) if event.kind.is_modify() => {
                tracing::info!("song file changed, reloading");
                let _ = commands.send(EngineCommand::LoadProject(watched.clone()));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "watch error"),
        },
        Config::default(),
    );

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(error = %e, "cannot watch the song file");
            return None;
        }
    };
    match watcher.watch(path, RecursiveMode::NonRecursive) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "watching for changes");
            Some(watcher)
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot watch the song file");
            None
        }
    }
}

fn run_interactive(
    engine: &EngineHandle,
    settings: &Settings,
    song_path: &Path,
    tempo_override: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    let _watcher = if settings.watch && song_path.exists() {
        watch_song(engine.command_tx.clone(), song_path)
    } else {
        None
    };

    println!("{KEYS}");
    terminal::enable_raw_mode()?;
    let result = key_loop(engine, settings, song_path, tempo_override);
    terminal::disable_raw_mode()?;
    result
}

fn key_loop(
    engine: &EngineHandle,
    settings: &Settings,
    song_path: &Path,
    mut tempo_override: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    let mut tempo = settings.tempo_bpm;
    let mut looping = settings.loop_playback;
    let mut playing = false;

    loop {
        while let Ok(update) = engine.update_rx.try_recv() {
            match update {
                EngineUpdate::ProjectLoaded { project } => {
                    tempo = tempo_override.take().unwrap_or(project.tempo);
                    tracing::info!(
                        tracks = project.tracks.len(),
                        bpm = tempo,
                        "song ready"
                    );
                }
                EngineUpdate::PlaybackState { playing: now } => {
                    playing = now;
                    tracing::info!(playing, "playback");
                }
                EngineUpdate::Error { message } => tracing::warn!("{message}"),
            }
        }

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
            KeyCode::Char(' ') if playing => engine.send(EngineCommand::Stop),
            KeyCode::Char(' ') => engine.send(EngineCommand::PlaySong),
            KeyCode::Char(c) if c.is_ascii_digit() => {
                let index = c.to_digit(10).unwrap_or(0) as usize;
                engine.send(EngineCommand::PlayTrack(index));
            }
            KeyCode::Char('l') => {
                looping = !looping;
                tracing::info!(looping, "loop");
                engine.send(EngineCommand::SetLoop(looping));
            }
            KeyCode::Char('+') | KeyCode::Char('=') => {
                tempo = tempo.saturating_add(TEMPO_STEP);
                tracing::info!(bpm = tempo, "tempo");
                engine.send(EngineCommand::SetTempo(tempo));
            }
            KeyCode::Char('-') => {
                tempo = tempo.saturating_sub(TEMPO_STEP).max(1);
                tracing::info!(bpm = tempo, "tempo");
                engine.send(EngineCommand::SetTempo(tempo));
            }
            KeyCode::Char('s') => {
                engine.send(EngineCommand::SaveProject(song_path.to_path_buf()));
            }
            _ => {}
        }
    }

    Ok(())
}
