//! The plain song format: one value per line, read back as a stream of
//! whitespace-separated tokens.
//!
//! ```text
//! <tempo>
//! <track count>
//! <label> <number> <instrument> <volume> <length> <event count>   per track
//!   <kind> <label> <time> <channel> <value> <duration>            per event
//! song <length> <event count>
//!   <kind> <label> <time> <channel> <value> <duration>
//! ```

use std::fmt::Write as _;
use std::str::{FromStr, SplitWhitespace};

use super::{EventRecord, Project, ProjectError, SongRecord, TrackRecord};
use crate::events::EventKind;

struct Tokens<'a> {
    inner: SplitWhitespace<'a>,
    position: usize,
}

impl<'a> Tokens<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            inner: source.split_whitespace(),
            position: 0,
        }
    }

    fn word(&mut self, expected: &'static str) -> Result<&'a str, ProjectError> {
        self.position += 1;
        self.inner.next().ok_or(ProjectError::Malformed {
            position: self.position,
            expected,
            found: "end of file".to_string(),
        })
    }

    fn number<T: FromStr>(&mut self, expected: &'static str) -> Result<T, ProjectError> {
        let token = self.word(expected)?;
        token.parse().map_err(|_| ProjectError::Malformed {
            position: self.position,
            expected,
            found: format!("'{token}'"),
        })
    }

    fn keyword(&mut self, keyword: &'static str) -> Result<(), ProjectError> {
        let token = self.word(keyword)?;
        if token == keyword {
            Ok(())
        } else {
            Err(ProjectError::Malformed {
                position: self.position,
                expected: keyword,
                found: format!("'{token}'"),
            })
        }
    }
}

fn parse_event(tokens: &mut Tokens<'_>) -> Result<EventRecord, ProjectError> {
    let kind = EventKind::from_str(tokens.word("event kind")?)?;
    Ok(EventRecord {
        kind,
        label: tokens.word("event label")?.to_string(),
        time: tokens.number("event time")?,
        channel: tokens.number("event channel")?,
        value: tokens.number("event value")?,
        duration: tokens.number("event duration")?,
    })
}

fn parse_events(tokens: &mut Tokens<'_>) -> Result<Vec<EventRecord>, ProjectError> {
    let count: usize = tokens.number("event count")?;
    (0..count).map(|_| parse_event(tokens)).collect()
}

fn parse_track(tokens: &mut Tokens<'_>) -> Result<TrackRecord, ProjectError> {
    Ok(TrackRecord {
        label: tokens.word("track label")?.to_string(),
        number: tokens.number("track number")?,
        instrument: tokens.number("instrument")?,
        volume: tokens.number("volume")?,
        length: tokens.number("track length")?,
        events: parse_events(tokens)?,
    })
}

/// Tokens after the song block are ignored.
pub fn parse(source: &str) -> Result<Project, ProjectError> {
    let mut tokens = Tokens::new(source);

    let tempo = tokens.number("tempo")?;
    let track_count: usize = tokens.number("track count")?;
    let tracks = (0..track_count)
        .map(|_| parse_track(&mut tokens))
        .collect::<Result<Vec<_>, _>>()?;

    tokens.keyword("song")?;
    let song = SongRecord {
        length: tokens.number("song length")?,
        events: parse_events(&mut tokens)?,
    };

    Ok(Project {
        tempo,
        tracks,
        song,
    })
}

fn check_label(label: &str) -> Result<&str, ProjectError> {
    if label.is_empty() || label.chars().any(char::is_whitespace) {
        Err(ProjectError::InvalidLabel(label.to_string()))
    } else {
        Ok(label)
    }
}

fn write_events(out: &mut String, events: &[EventRecord]) -> Result<(), ProjectError> {
    writeln!(out, "{}", events.len())?;
    for event in events {
        writeln!(
            out,
            "{}\n{}\n{}\n{}\n{}\n{}",
            event.kind,
            check_label(&event.label)?,
            event.time,
            event.channel,
            event.value,
            event.duration
        )?;
    }
    Ok(())
}

pub fn write(project: &Project) -> Result<String, ProjectError> {
    let mut out = String::new();
    writeln!(out, "{}", project.tempo)?;
    writeln!(out, "{}", project.tracks.len())?;

    for track in &project.tracks {
        writeln!(
            out,
            "{}\n{}\n{}\n{}\n{}",
            check_label(&track.label)?,
            track.number,
            track.instrument,
            track.volume,
            track.length
        )?;
        write_events(&mut out, &track.events)?;
    }

    writeln!(out, "song\n{}", project.song.length)?;
    write_events(&mut out, &project.song.events)?;
    Ok(out)
}
