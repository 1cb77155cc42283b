//! Compiles a printf-style template into an object-store key formatter.
//!
//! The template is parsed once, at configuration time, into a sequence of [`Segment`]s. Formatting
//! a [`blobby_common::FileId`] (passed in by callers as its three raw fields, so this crate
//! doesn't need to depend on `blobby-common` for a single struct) is then a pure, allocation-light
//! walk over those segments — no further parsing happens on the hot path.
//!
//! Per , the compiler also records which of `{time, machine id, counter}` a
//! template actually needs, so callers can skip extracting fields the template never uses.

use std::fmt::Write as _;

use chrono::{DateTime, Datelike, Timelike, Utc};
use snafu::Snafu;

/// Zero/none/space padding for two-digit calendar fields and the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pad {
    Zero,
    None,
    Space,
}

/// How a machine id directive should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineForm {
    Decimal(Pad),
    DottedQuad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Year,
    Month(Pad),
    Day(Pad),
    Hour(Pad),
    Minute(Pad),
    Second(Pad),
    DateIso,
    TimeIso,
    Counter(Pad),
    MachineId(MachineForm),
    EpochSeconds,
}

/// Which raw FID fields a compiled template actually reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub time: bool,
    pub counter: bool,
    pub machine_id: bool,
}

/// Errors compiling a key template.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum KeyTemplateError {
    #[snafu(display("template ends with a trailing, unterminated '%'"))]
    UnterminatedDirective,

    #[snafu(display("unknown format directive '%{modifier}{letter}'"))]
    UnknownDirective { modifier: char, letter: char },

    #[snafu(display("directive '%{letter}' does not accept a padding modifier"))]
    UnsupportedModifier { letter: char },

    #[snafu(display("'%.{letter}' is not a recognized dotted form"))]
    UnknownDottedForm { letter: char },
}

/// A compiled object-store key template.
#[derive(Debug, Clone)]
pub struct KeyTemplate {
    segments: Vec<Segment>,
    requirements: Requirements,
}

impl KeyTemplate {
    /// Compiles `template` into a [`KeyTemplate`].
    ///
    /// # Errors
    ///
    /// Returns [`KeyTemplateError`] if the template contains an unknown or malformed directive.
    pub fn compile(template: &str) -> Result<Self, KeyTemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        macro_rules! flush_literal {
            () => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
            };
        }

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }

            let modifier = chars.next().ok_or(KeyTemplateError::UnterminatedDirective)?;

            match modifier {
                '%' => literal.push('%'),
                'n' => literal.push('\n'),
                't' => literal.push('\t'),
                '-' | '_' | '.' => {
                    let letter = chars
                        .next()
                        .ok_or(KeyTemplateError::UnterminatedDirective)?;
                    let pad = match modifier {
                        '-' => Pad::None,
                        '_' => Pad::Space,
                        _ => Pad::Zero, // unused for '.', which only applies to %L
                    };

                    if modifier == '.' {
                        if letter != 'L' {
                            return Err(KeyTemplateError::UnknownDottedForm { letter });
                        }
                        flush_literal!();
                        segments.push(Segment::MachineId(MachineForm::DottedQuad));
                        continue;
                    }

                    flush_literal!();
                    segments.push(match letter {
                        'm' => Segment::Month(pad),
                        'd' => Segment::Day(pad),
                        'H' => Segment::Hour(pad),
                        'M' => Segment::Minute(pad),
                        'S' => Segment::Second(pad),
                        'K' => Segment::Counter(pad),
                        'L' => Segment::MachineId(MachineForm::Decimal(pad)),
                        other => {
                            return Err(KeyTemplateError::UnknownDirective {
                                modifier,
                                letter: other,
                            })
                        }
                    });
                }
                letter => {
                    flush_literal!();
                    segments.push(match letter {
                        'y' => Segment::Year,
                        'm' => Segment::Month(Pad::Zero),
                        'd' => Segment::Day(Pad::Zero),
                        'H' => Segment::Hour(Pad::Zero),
                        'M' => Segment::Minute(Pad::Zero),
                        'S' => Segment::Second(Pad::Zero),
                        'F' => Segment::DateIso,
                        'T' => Segment::TimeIso,
                        'K' => Segment::Counter(Pad::Zero),
                        'L' => Segment::MachineId(MachineForm::Decimal(Pad::None)),
                        's' => Segment::EpochSeconds,
                        other => {
                            return Err(KeyTemplateError::UnknownDirective {
                                modifier: '%',
                                letter: other,
                            })
                        }
                    });
                }
            }
        }

        flush_literal!();

        let requirements = segments.iter().fold(Requirements::default(), |mut r, s| {
            match s {
                Segment::Year
                | Segment::Month(_)
                | Segment::Day(_)
                | Segment::Hour(_)
                | Segment::Minute(_)
                | Segment::Second(_)
                | Segment::DateIso
                | Segment::TimeIso
                | Segment::EpochSeconds => r.time = true,
                Segment::Counter(_) => r.counter = true,
                Segment::MachineId(_) => r.machine_id = true,
                Segment::Literal(_) => {}
            }
            r
        });

        Ok(Self {
            segments,
            requirements,
        })
    }

    /// Which raw fields this template reads; lets a caller skip extracting fields it never uses.
    #[must_use]
    pub fn requirements(&self) -> Requirements {
        self.requirements
    }

    /// Renders the key for a FID's three raw fields.
    ///
    /// This is a pure function: the same inputs always produce the same output, which is the
    /// property the object-store layer depends on to re-derive a key deterministically.
    #[must_use]
    pub fn format(&self, epoch_seconds: u32, counter: u16, machine_id: u32) -> String {
        let dt = if self.requirements.time {
            DateTime::<Utc>::from_timestamp(i64::from(epoch_seconds), 0)
                .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
        } else {
            DateTime::<Utc>::from_timestamp(0, 0).unwrap()
        };

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Year => write_num(&mut out, dt.year(), Pad::Zero, 4),
                Segment::Month(pad) => write_num(&mut out, dt.month() as i32, *pad, 2),
                Segment::Day(pad) => write_num(&mut out, dt.day() as i32, *pad, 2),
                Segment::Hour(pad) => write_num(&mut out, dt.hour() as i32, *pad, 2),
                Segment::Minute(pad) => write_num(&mut out, dt.minute() as i32, *pad, 2),
                Segment::Second(pad) => write_num(&mut out, dt.second() as i32, *pad, 2),
                Segment::DateIso => {
                    let _ = write!(
                        out,
                        "{:04}-{:02}-{:02}",
                        dt.year(),
                        dt.month(),
                        dt.day()
                    );
                }
                Segment::TimeIso => {
                    let _ = write!(
                        out,
                        "{:02}:{:02}:{:02}",
                        dt.hour(),
                        dt.minute(),
                        dt.second()
                    );
                }
                Segment::Counter(pad) => write_num(&mut out, i32::from(counter), *pad, 5),
                Segment::MachineId(MachineForm::Decimal(pad)) => {
                    write_u32(&mut out, machine_id, *pad, 10);
                }
                Segment::MachineId(MachineForm::DottedQuad) => {
                    let bytes = machine_id.to_be_bytes();
                    let _ = write!(
                        out,
                        "{}.{}.{}.{}",
                        bytes[0], bytes[1], bytes[2], bytes[3]
                    );
                }
                Segment::EpochSeconds => {
                    let _ = write!(out, "{epoch_seconds}");
                }
            }
        }
        out
    }
}

fn write_num(out: &mut String, value: i32, pad: Pad, width: usize) {
    match pad {
        Pad::None => {
            let _ = write!(out, "{value}");
        }
        Pad::Zero => {
            let _ = write!(out, "{value:0width$}");
        }
        Pad::Space => {
            let _ = write!(out, "{value:width$}");
        }
    }
}

fn write_u32(out: &mut String, value: u32, pad: Pad, width: usize) {
    match pad {
        Pad::None => {
            let _ = write!(out, "{value}");
        }
        Pad::Zero => {
            let _ = write!(out, "{value:0width$}");
        }
        Pad::Space => {
            let _ = write!(out, "{value:width$}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_iso_date_and_time() {
        let tpl = KeyTemplate::compile("%F/%T").unwrap();
        assert!(tpl.requirements().time);
        assert!(!tpl.requirements().counter);
        assert!(!tpl.requirements().machine_id);

        // 2023-11-14T22:13:20Z
        let rendered = tpl.format(1_700_000_000, 0, 0);
        assert_eq!(rendered, "2023-11-14/22:13:20");
    }

    #[test]
    fn formats_counter_and_machine_decimal() {
        let tpl = KeyTemplate::compile("c%Km%L").unwrap();
        assert!(tpl.requirements().counter);
        assert!(tpl.requirements().machine_id);
        assert!(!tpl.requirements().time);

        assert_eq!(tpl.format(0, 7, 42), "c00007m42");
    }

    #[test]
    fn formats_dotted_quad_machine_id() {
        let tpl = KeyTemplate::compile("%.L").unwrap();
        // 10.0.0.1
        let machine_id = u32::from_be_bytes([10, 0, 0, 1]);
        assert_eq!(tpl.format(0, 0, machine_id), "10.0.0.1");
    }

    #[test]
    fn no_pad_and_space_pad_variants() {
        let tpl = KeyTemplate::compile("%-m|%_m").unwrap();
        let rendered = tpl.format(1_700_000_000, 0, 0); // month = 11
        assert_eq!(rendered, "11|11");

        let tpl2 = KeyTemplate::compile("[%-d|%_d]").unwrap();
        // 2023-11-05T00:00:00Z: single-digit day, so the no-pad and space-pad forms diverge.
        let rendered2 = tpl2.format(1_699_142_400, 0, 0);
        assert_eq!(rendered2, "[5| 5]");
    }

    #[test]
    fn literal_escapes() {
        let tpl = KeyTemplate::compile("a%%b%nc%td").unwrap();
        assert_eq!(tpl.format(0, 0, 0), "a%b\nc\td");
    }

    #[test]
    fn same_fid_fields_always_format_identically() {
        let tpl = KeyTemplate::compile("%y/%m/%d/%H%M%S-%K-%L").unwrap();
        let a = tpl.format(1_700_000_000, 5, 9);
        let b = tpl.format(1_700_000_000, 5, 9);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_unknown_directive() {
        assert_eq!(
            KeyTemplate::compile("%Q").unwrap_err(),
            KeyTemplateError::UnknownDirective {
                modifier: '%',
                letter: 'Q'
            }
        );
    }

    #[test]
    fn rejects_unterminated_directive() {
        assert_eq!(
            KeyTemplate::compile("abc%").unwrap_err(),
            KeyTemplateError::UnterminatedDirective
        );
    }
}
