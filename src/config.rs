use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "sketchseq.ron";
pub const CONFIG_ENV: &str = "SKETCHSEQ_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings in {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{0}")]
    Usage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputKind {
    #[default]
    Synth,
    Midi,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output: OutputKind,
    /// Substring of the MIDI port name; the first port when absent.
    pub midi_port: Option<String>,
    /// Synth output rate; the device default when absent.
    pub sample_rate: Option<u32>,
    /// Tempo of a new, empty song.
    pub tempo_bpm: u32,
    pub loop_playback: bool,
    /// Reload the song file when it changes on disk.
    pub watch: bool,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output: OutputKind::Synth,
            midi_port: None,
            sample_rate: None,
            tempo_bpm: 50,
            loop_playback: false,
            watch: true,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn parse(source: &str, path: &Path) -> Result<Self, ConfigError> {
        ron::from_str(source).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source, path)
    }

    /// A missing file gives the defaults; an unreadable or malformed one
    /// is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `explicit`, then `$SKETCHSEQ_CONFIG`, then `./sketchseq.ron`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default()).map_err(|e| {
            ConfigError::Parse {
                path: PathBuf::new(),
                message: e.to_string(),
            }
        })
    }
}

pub const USAGE: &str = "usage: sketchseq [options] [song]

  --config <path>   settings file (default: sketchseq.ron)
  --synth           play through the built-in synthesizer
  --midi[=port]     play through a MIDI output port
  --silent          play without sound
  --dry-run         log every device call instead of playing
  --ports           list MIDI output ports and exit
  --loop            loop the song
  --tempo <bpm>     override the song tempo
  --once            play the song once and exit
  --no-watch        do not reload the song when it changes";

/// Command-line overrides. Anything left unset keeps the settings file's
/// value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub song: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub output: Option<OutputKind>,
    pub midi_port: Option<String>,
    pub looping: bool,
    pub tempo_bpm: Option<u32>,
    pub once: bool,
    pub dry_run: bool,
    pub list_ports: bool,
    pub no_watch: bool,
    pub help: bool,
}

impl CliArgs {
    /// Parses arguments without the program name.
    pub fn parse<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = CliArgs::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args
                        .next()
                        .ok_or_else(|| ConfigError::Usage("--config needs a path".to_string()))?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--synth" => parsed.output = Some(OutputKind::Synth),
                "--silent" => parsed.output = Some(OutputKind::Silent),
                "--midi" => parsed.output = Some(OutputKind::Midi),
                "--dry-run" => parsed.dry_run = true,
                "--ports" => parsed.list_ports = true,
                "--loop" => parsed.looping = true,
                "--once" => parsed.once = true,
                "--no-watch" => parsed.no_watch = true,
                "-h" | "--help" => parsed.help = true,
                "--tempo" => {
                    let value = args
                        .next()
                        .ok_or_else(|| ConfigError::Usage("--tempo needs a value".to_string()))?;
                    let bpm = value
                        .parse::<u32>()
                        .ok()
                        .filter(|bpm| *bpm > 0)
                        .ok_or_else(|| ConfigError::Usage(format!("invalid tempo '{value}'")))?;
                    parsed.tempo_bpm = Some(bpm);
                }
                other => {
                    if let Some(port) = other.strip_prefix("--midi=") {
                        parsed.output = Some(OutputKind::Midi);
                        parsed.midi_port = Some(port.to_string());
                    } else if other.starts_with('-') {
                        return Err(ConfigError::Usage(format!("unknown option '{other}'")));
                    } else if parsed.song.is_none() {
                        parsed.song = Some(PathBuf::from(other));
                    } else {
                        return Err(ConfigError::Usage(format!("unexpected argument '{other}'")));
                    }
                }
            }
        }

        Ok(parsed)
    }

    pub fn apply(&self, settings: &mut Settings) {
        if let Some(output) = self.output {
            settings.output = output;
        }
        if self.midi_port.is_some() {
            settings.midi_port = self.midi_port.clone();
        }
        if self.looping {
            settings.loop_playback = true;
        }
        if self.no_watch || self.once {
            settings.watch = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<CliArgs, ConfigError> {
        CliArgs::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::parse("()", Path::new("test.ron")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let source = r#"(
            output: Midi,
            midi_port: Some("IAC"),
            loop_playback: true,
        )"#;
        let settings = Settings::parse(source, Path::new("test.ron")).unwrap();
        assert_eq!(settings.output, OutputKind::Midi);
        assert_eq!(settings.midi_port.as_deref(), Some("IAC"));
        assert!(settings.loop_playback);
        assert_eq!(settings.tempo_bpm, 50);
        assert!(settings.watch);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let err = Settings::parse("(output: Loud)", Path::new("bad.ron")).unwrap_err();
        assert!(err.to_string().contains("bad.ron"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("sketchseq-missing-settings.ron");
        let _ = fs::remove_file(&path);
        assert_eq!(Settings::load_or_default(&path).unwrap(), Settings::default());
    }

    #[test]
    fn settings_survive_a_save_and_load() {
        let settings = Settings {
            output: OutputKind::Silent,
            sample_rate: Some(48_000),
            tempo_bpm: 120,
            ..Settings::default()
        };
        let text = settings.to_ron().unwrap();
        assert_eq!(Settings::parse(&text, Path::new("x.ron")).unwrap(), settings);
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            Settings::locate(Some(Path::new("custom.ron"))),
            PathBuf::from("custom.ron")
        );
    }

    #[test]
    fn parses_flags_and_song() {
        let parsed = args(&["--loop", "--tempo", "120", "--midi=IAC", "song.txt"]).unwrap();
        assert!(parsed.looping);
        assert_eq!(parsed.tempo_bpm, Some(120));
        assert_eq!(parsed.output, Some(OutputKind::Midi));
        assert_eq!(parsed.midi_port.as_deref(), Some("IAC"));
        assert_eq!(parsed.song, Some(PathBuf::from("song.txt")));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(args(&["--tempo"]).is_err());
        assert!(args(&["--tempo", "0"]).is_err());
        assert!(args(&["--tempo", "fast"]).is_err());
        assert!(args(&["--bogus"]).is_err());
        assert!(args(&["a.txt", "b.txt"]).is_err());
    }

    #[test]
    fn flags_override_settings() {
        let mut settings = Settings::default();
        args(&["--silent", "--loop", "--once"])
            .unwrap()
            .apply(&mut settings);
        assert_eq!(settings.output, OutputKind::Silent);
        assert!(settings.loop_playback);
        assert!(!settings.watch);
    }
}
