//! Frame rates and SMPTE timecodes
//!
//! Rates are exact rationals so 29.97 (30000/1001) never drifts. Drop-frame
//! counting is supported for 29.97 and 59.94 only, the two rates where SMPTE
//! defines it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Frame rate as an exact rational plus drop-frame labelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "FpsInput", into = "String")]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
    pub drop_frame: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FpsInput {
    Integer(u32),
    Float(f64),
    Text(String),
}

impl TryFrom<FpsInput> for FrameRate {
    type Error = IngestError;

    fn try_from(input: FpsInput) -> Result<Self, Self::Error> {
        match input {
            FpsInput::Integer(fps) => FrameRate::integer(fps),
            FpsInput::Float(fps) => fps.to_string().parse(),
            FpsInput::Text(text) => text.parse(),
        }
    }
}

impl From<FrameRate> for String {
    fn from(rate: FrameRate) -> Self {
        rate.to_string()
    }
}

impl FrameRate {
    pub fn integer(fps: u32) -> Result<Self, IngestError> {
        if fps == 0 {
            return Err(IngestError::Validation("frame rate must be > 0".to_string()));
        }
        Ok(Self {
            num: fps,
            den: 1,
            drop_frame: false,
        })
    }

    pub fn rational(num: u32, den: u32) -> Result<Self, IngestError> {
        if num == 0 || den == 0 {
            return Err(IngestError::Validation(format!("invalid frame rate {}/{}", num, den)));
        }
        Ok(Self {
            num,
            den,
            drop_frame: false,
        })
    }

    /// 29.97 / 59.94 with drop-frame labels
    pub fn with_drop_frame(self) -> Result<Self, IngestError> {
        if self.drop_frames_per_minute().is_none() {
            return Err(IngestError::Validation(format!(
                "drop-frame is only defined for 29.97 and 59.94, not {}",
                self
            )));
        }
        Ok(Self {
            drop_frame: true,
            ..self
        })
    }

    /// Rounded frames per second used for timecode labels
    pub fn nominal(&self) -> u32 {
        ((self.num as u64 + self.den as u64 / 2) / self.den as u64) as u32
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Same playback speed, regardless of drop-frame labelling
    pub fn same_rate(&self, other: &FrameRate) -> bool {
        self.num as u64 * other.den as u64 == other.num as u64 * self.den as u64
    }

    fn is_ntsc(&self) -> bool {
        self.den == 1001 && self.num % 1000 == 0
    }

    fn drop_frames_per_minute(&self) -> Option<u32> {
        match (self.is_ntsc(), self.nominal()) {
            (true, 30) => Some(2),
            (true, 60) => Some(4),
            _ => None,
        }
    }

    /// Convert a frame count at `from` into the nearest frame at `self`
    pub fn resample_from(&self, frames: i64, from: &FrameRate) -> i64 {
        let numer = frames as i128 * from.den as i128 * self.num as i128;
        let denom = from.num as i128 * self.den as i128;
        // Round half away from zero
        let rounded = if numer >= 0 {
            (2 * numer + denom) / (2 * denom)
        } else {
            -((2 * -numer + denom) / (2 * denom))
        };
        rounded as i64
    }

    /// Nearest frame for a wall-clock offset in seconds
    pub fn frames_from_seconds(&self, seconds: f64) -> i64 {
        (seconds * self.as_f64()).round() as i64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)?;
        } else if self.is_ntsc() {
            let whole = self.num / 1000;
            // 24000/1001 → 23.976, 30000/1001 → 29.97, 60000/1001 → 59.94
            match whole {
                24 => write!(f, "23.976")?,
                30 => write!(f, "29.97")?,
                60 => write!(f, "59.94")?,
                48 => write!(f, "47.952")?,
                _ => write!(f, "{}/{}", self.num, self.den)?,
            }
        } else {
            write!(f, "{}/{}", self.num, self.den)?;
        }
        if self.drop_frame {
            write!(f, "df")?;
        }
        Ok(())
    }
}

impl FromStr for FrameRate {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let (body, drop_frame) = match text.strip_suffix("df") {
            Some(body) => (body.trim(), true),
            None => (text.as_str(), false),
        };

        let rate = match body {
            "23.976" | "23.98" => FrameRate::rational(24_000, 1001)?,
            "29.97" => FrameRate::rational(30_000, 1001)?,
            "47.952" | "47.95" => FrameRate::rational(48_000, 1001)?,
            "59.94" => FrameRate::rational(60_000, 1001)?,
            other => {
                if let Some((num, den)) = other.split_once('/') {
                    let num = num.trim().parse::<u32>();
                    let den = den.trim().parse::<u32>();
                    match (num, den) {
                        (Ok(num), Ok(den)) => FrameRate::rational(num, den)?,
                        _ => return Err(IngestError::Validation(format!("invalid frame rate '{}'", s))),
                    }
                } else if let Ok(fps) = other.parse::<u32>() {
                    FrameRate::integer(fps)?
                } else if let Ok(fps) = other.parse::<f64>() {
                    if fps.fract() == 0.0 && fps > 0.0 && fps <= u32::MAX as f64 {
                        FrameRate::integer(fps as u32)?
                    } else {
                        return Err(IngestError::Validation(format!("unsupported frame rate '{}'", s)));
                    }
                } else {
                    return Err(IngestError::Validation(format!("invalid frame rate '{}'", s)));
                }
            }
        };

        if drop_frame {
            rate.with_drop_frame()
        } else {
            Ok(rate)
        }
    }
}

/// SMPTE timecode label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timecode {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: u32,
    pub drop_frame: bool,
}

impl Timecode {
    pub const ZERO: Timecode = Timecode {
        hours: 0,
        minutes: 0,
        seconds: 0,
        frames: 0,
        drop_frame: false,
    };

    /// Parse `HH:MM:SS:FF` (or `HH:MM:SS;FF` for drop-frame) against a rate
    pub fn parse(text: &str, rate: &FrameRate) -> Result<Self, IngestError> {
        let invalid = |why: &str| IngestError::SchemaInvalid(format!("timecode '{}': {}", text, why));

        let trimmed = text.trim();
        let semicolon = trimmed.contains(';');
        let parts: Vec<&str> = trimmed.split([':', ';', '.']).collect();
        if parts.len() != 4 {
            return Err(invalid("expected HH:MM:SS:FF"));
        }
        let mut fields = [0u32; 4];
        for (slot, part) in fields.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("non-numeric field"));
            }
            *slot = part.parse().map_err(|_| invalid("field out of range"))?;
        }
        let [hours, minutes, seconds, frames] = fields;

        if minutes >= 60 || seconds >= 60 {
            return Err(invalid("minutes/seconds must be < 60"));
        }
        if frames >= rate.nominal() {
            return Err(invalid("frame field exceeds frame rate"));
        }

        let drop_frame = semicolon || rate.drop_frame;
        if drop_frame {
            let drop = rate
                .drop_frames_per_minute()
                .ok_or_else(|| invalid("drop-frame label at a non drop-frame rate"))?;
            if seconds == 0 && minutes % 10 != 0 && frames < drop {
                return Err(invalid("label skipped by drop-frame counting"));
            }
        }

        Ok(Self {
            hours,
            minutes,
            seconds,
            frames,
            drop_frame,
        })
    }

    /// Absolute frame count since 00:00:00:00
    pub fn to_frames(&self, rate: &FrameRate) -> i64 {
        let nominal = rate.nominal() as i64;
        let total_minutes = 60 * self.hours as i64 + self.minutes as i64;
        let mut frames = (total_minutes * 60 + self.seconds as i64) * nominal + self.frames as i64;
        if self.drop_frame {
            if let Some(drop) = rate.drop_frames_per_minute() {
                frames -= drop as i64 * (total_minutes - total_minutes / 10);
            }
        }
        frames
    }

    /// Label for an absolute frame count
    pub fn from_frames(frames: i64, rate: &FrameRate) -> Self {
        let nominal = rate.nominal() as i64;
        let mut count = frames.max(0);
        let drop_frame = rate.drop_frame && rate.drop_frames_per_minute().is_some();

        if drop_frame {
            let drop = rate.drop_frames_per_minute().unwrap_or(0) as i64;
            let per_ten_minutes = nominal * 600 - drop * 9;
            let per_minute = nominal * 60 - drop;
            let tens = count / per_ten_minutes;
            let rem = count % per_ten_minutes;
            count += drop * 9 * tens;
            if rem > drop {
                count += drop * ((rem - drop) / per_minute);
            }
        }

        let frame = count % nominal;
        let total_seconds = count / nominal;
        Self {
            hours: (total_seconds / 3600) as u32,
            minutes: ((total_seconds / 60) % 60) as u32,
            seconds: (total_seconds % 60) as u32,
            frames: frame as u32,
            drop_frame,
        }
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}
