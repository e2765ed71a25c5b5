//! Terminal presentation helpers

use std::fmt;

/// Echoes streamed fragments while hiding everything from the first marker on.
///
/// A marker can straddle fragments, so the tail that might be the start of
/// one is held back until the next fragment (or `finish`) decides it.
#[derive(Debug, Clone)]
pub struct FragmentEcho {
    markers: Vec<String>,
    holdback: usize,
    buffer: String,
    echoed: usize,
    hidden: bool,
}

impl FragmentEcho {
    /// Markers match ASCII case-insensitively
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let markers: Vec<String> = markers
            .into_iter()
            .map(|m| m.as_ref().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        let holdback = markers.iter().map(|m| m.len().saturating_sub(1)).max().unwrap_or(0);
        Self {
            markers,
            holdback,
            buffer: String::new(),
            echoed: 0,
            hidden: false,
        }
    }

    /// Append a fragment and return the text that may now be shown
    pub fn push(&mut self, fragment: &str) -> &str {
        if self.hidden {
            return "";
        }
        self.buffer.push_str(fragment);
        let start = self.echoed;

        let upper = self.buffer[start..].to_ascii_uppercase();
        let found = self
            .markers
            .iter()
            .filter_map(|m| upper.find(m.as_str()))
            .min();

        let end = match found {
            Some(offset) => {
                self.hidden = true;
                start + offset
            }
            None => {
                let mut end = self.buffer.len().saturating_sub(self.holdback).max(start);
                while !self.buffer.is_char_boundary(end) {
                    end -= 1;
                }
                end
            }
        };
        self.echoed = end;
        &self.buffer[start..end]
    }

    /// Release whatever was held back
    pub fn finish(&mut self) -> &str {
        if self.hidden {
            return "";
        }
        let start = self.echoed;
        self.echoed = self.buffer.len();
        &self.buffer[start..]
    }
}

/// Running score of a play session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scoreboard {
    pub rounds: u32,
    pub correct: u32,
    /// Verdicts that could not be read as right or wrong
    pub unscored: u32,
}

impl Scoreboard {
    pub fn record(&mut self, correct: Option<bool>) {
        self.rounds += 1;
        match correct {
            Some(true) => self.correct += 1,
            Some(false) => {}
            None => self.unscored += 1,
        }
    }
}

impl fmt::Display for Scoreboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} correct", self.correct, self.rounds - self.unscored)?;
        if self.unscored > 0 {
            write!(f, " ({} unscored)", self.unscored)?;
        }
        Ok(())
    }
}
