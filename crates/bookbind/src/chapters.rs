//! Chapter table computation and the `FFMETADATA1` interchange format.

use std::fmt::Write as _;
use std::time::Duration;

use crate::error::{AssemblyError, Result};

pub const FFMETADATA_HEADER: &str = ";FFMETADATA1";

/// A labeled time range; `end_ms` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub start_ms: u64,
    pub end_ms: u64,
    pub title: String,
}

impl Chapter {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Ordered, gapless chapters covering the whole book.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterTable {
    chapters: Vec<Chapter>,
}

impl ChapterTable {
    /// Builds a table after checking that it starts at zero, has no gaps, and no empty chapter.
    pub fn new(chapters: Vec<Chapter>) -> Result<Self> {
        let mut cursor = 0;
        for (index, chapter) in chapters.iter().enumerate() {
            if chapter.start_ms != cursor {
                return Err(AssemblyError::chapter_integrity(
                    index,
                    format!("starts at {} ms, expected {cursor} ms", chapter.start_ms),
                ));
            }
            if chapter.end_ms <= chapter.start_ms {
                return Err(AssemblyError::chapter_integrity(
                    index,
                    format!(
                        "ends at {} ms, not after its start at {} ms",
                        chapter.end_ms, chapter.start_ms
                    ),
                ));
            }
            cursor = chapter.end_ms;
        }
        Ok(Self { chapters })
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn total_ms(&self) -> u64 {
        self.chapters.last().map_or(0, |c| c.end_ms)
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_ms())
    }

    /// Serializes to `FFMETADATA1` with a millisecond timebase.
    pub fn to_ffmetadata(&self) -> String {
        let mut out = String::from(FFMETADATA_HEADER);
        out.push('\n');
        for chapter in &self.chapters {
            let _ = write!(
                out,
                "\n[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}\ntitle={}\n",
                chapter.start_ms,
                chapter.end_ms,
                escape_value(&chapter.title)
            );
        }
        out
    }

    /// Parses the chapter blocks of an `FFMETADATA1` document.
    ///
    /// Global tags and other sections are ignored; chapter times are converted to
    /// milliseconds from their declared timebase.
    pub fn parse_ffmetadata(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        match lines.next() {
            Some(first) if first.trim_end() == FFMETADATA_HEADER => {}
            _ => {
                return Err(AssemblyError::chapter_integrity(0, "missing ;FFMETADATA1 header"));
            }
        }

        let mut chapters = Vec::new();
        let mut current: Option<RawChapter> = None;
        let mut in_chapter = false;

        for line in logical_lines(lines) {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                if let Some(raw) = current.take() {
                    chapters.push(raw.finish(chapters.len())?);
                }
                in_chapter = line.eq_ignore_ascii_case("[CHAPTER]");
                if in_chapter {
                    current = Some(RawChapter::default());
                }
                continue;
            }
            if !in_chapter {
                continue;
            }
            let Some(raw) = current.as_mut() else {
                continue;
            };
            let Some((key, value)) = split_unescaped(&line) else {
                continue;
            };
            let index = chapters.len();
            match key.to_ascii_uppercase().as_str() {
                "TIMEBASE" => raw.timebase = Some(parse_timebase(index, &value)?),
                "START" => raw.start = Some(parse_int(index, "START", &value)?),
                "END" => raw.end = Some(parse_int(index, "END", &value)?),
                "TITLE" => raw.title = Some(value),
                _ => {}
            }
        }
        if let Some(raw) = current.take() {
            chapters.push(raw.finish(chapters.len())?);
        }

        Self::new(chapters)
    }
}

#[derive(Debug, Default)]
struct RawChapter {
    timebase: Option<(u64, u64)>,
    start: Option<u64>,
    end: Option<u64>,
    title: Option<String>,
}

impl RawChapter {
    fn finish(self, index: usize) -> Result<Chapter> {
        let (num, den) = self.timebase.unwrap_or((1, 1000));
        let to_ms = |ticks: u64| -> u64 {
            let ms = (ticks as u128 * num as u128 * 1000 + den as u128 / 2) / den as u128;
            ms as u64
        };
        let start = self
            .start
            .ok_or_else(|| AssemblyError::chapter_integrity(index, "chapter without START"))?;
        let end = self
            .end
            .ok_or_else(|| AssemblyError::chapter_integrity(index, "chapter without END"))?;
        Ok(Chapter {
            start_ms: to_ms(start),
            end_ms: to_ms(end),
            title: self.title.unwrap_or_default(),
        })
    }
}

fn parse_int(index: usize, field: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| AssemblyError::chapter_integrity(index, format!("invalid {field} `{value}`")))
}

fn parse_timebase(index: usize, value: &str) -> Result<(u64, u64)> {
    let parsed = value.trim().split_once('/').and_then(|(n, d)| {
        let n: u64 = n.trim().parse().ok()?;
        let d: u64 = d.trim().parse().ok()?;
        (n > 0 && d > 0).then_some((n, d))
    });
    parsed.ok_or_else(|| AssemblyError::chapter_integrity(index, format!("invalid TIMEBASE `{value}`")))
}

/// Escapes the characters `FFMETADATA1` treats specially.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Joins lines whose newline was escaped with a trailing backslash.
fn logical_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();
    for line in lines {
        pending.push_str(line);
        if ends_with_unescaped_backslash(&pending) {
            pending.pop();
            pending.push('\n');
            continue;
        }
        out.push(std::mem::take(&mut pending));
    }
    if !pending.is_empty() {
        out.push(pending);
    }
    out
}

fn ends_with_unescaped_backslash(s: &str) -> bool {
    let trailing = s.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

/// Splits `key=value` at the first unescaped `=`, unescaping the value.
fn split_unescaped(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut value = String::new();
    let mut seen_eq = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let target = if seen_eq { &mut value } else { &mut key };
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    target.push(next);
                }
            }
            '=' if !seen_eq => seen_eq = true,
            _ => target.push(c),
        }
    }
    seen_eq.then_some((key, value))
}

/// Converts measured durations into a chapter table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChapterPlanner;

impl ChapterPlanner {
    /// Lays chapters end to end in the given order, starting at zero.
    ///
    /// Each duration is rounded to the nearest millisecond before it is added to the
    /// cursor, so the table's total is the sum of the rounded durations.
    pub fn plan<S: AsRef<str>>(&self, items: &[(S, Duration)]) -> Result<ChapterTable> {
        let mut cursor = 0u64;
        let mut chapters = Vec::with_capacity(items.len());
        for (index, (title, duration)) in items.iter().enumerate() {
            let length = round_to_ms(*duration);
            if length == 0 {
                return Err(AssemblyError::chapter_integrity(
                    index,
                    format!("`{}` has no measurable duration", title.as_ref()),
                ));
            }
            chapters.push(Chapter {
                start_ms: cursor,
                end_ms: cursor + length,
                title: title.as_ref().to_string(),
            });
            cursor += length;
        }
        ChapterTable::new(chapters)
    }
}

fn round_to_ms(duration: Duration) -> u64 {
    ((duration.as_nanos() + 500_000) / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course() -> Vec<(&'static str, Duration)> {
        vec![
            ("Introduction", Duration::from_secs_f64(600.0)),
            ("1.1 Basics", Duration::from_secs_f64(900.5)),
            ("1.2 Advanced", Duration::from_secs_f64(300.25)),
        ]
    }

    #[test]
    fn plans_cumulative_chapters() {
        let table = ChapterPlanner.plan(&course()).unwrap();
        let expected = vec![
            Chapter {
                start_ms: 0,
                end_ms: 600_000,
                title: "Introduction".into(),
            },
            Chapter {
                start_ms: 600_000,
                end_ms: 1_500_500,
                title: "1.1 Basics".into(),
            },
            Chapter {
                start_ms: 1_500_500,
                end_ms: 1_800_750,
                title: "1.2 Advanced".into(),
            },
        ];
        assert_eq!(table.chapters(), expected.as_slice());
        assert_eq!(table.total_ms(), 1_800_750);
    }

    #[test]
    fn planning_is_deterministic() {
        let first = ChapterPlanner.plan(&course()).unwrap();
        let second = ChapterPlanner.plan(&course()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sub_millisecond_remainders_round() {
        let items = [
            ("a", Duration::from_micros(1_499)),
            ("b", Duration::from_micros(1_500)),
            ("c", Duration::from_nanos(999_999_999)),
        ];
        let table = ChapterPlanner.plan(&items).unwrap();
        let ends: Vec<_> = table.chapters().iter().map(|c| c.end_ms).collect();
        assert_eq!(ends, vec![1, 3, 1_003]);
    }

    #[test]
    fn zero_duration_is_an_integrity_error() {
        let items = [("a", Duration::from_secs(3)), ("b", Duration::ZERO)];
        let err = ChapterPlanner.plan(&items).unwrap_err();
        assert!(matches!(err, AssemblyError::ChapterIntegrity { index: 1, .. }));
    }

    #[test]
    fn gaps_are_rejected() {
        let err = ChapterTable::new(vec![
            Chapter {
                start_ms: 0,
                end_ms: 10,
                title: "a".into(),
            },
            Chapter {
                start_ms: 11,
                end_ms: 20,
                title: "b".into(),
            },
        ])
        .unwrap_err();
        assert!(matches!(err, AssemblyError::ChapterIntegrity { index: 1, .. }));
    }

    #[test]
    fn ffmetadata_has_one_block_per_chapter() {
        let table = ChapterPlanner.plan(&course()).unwrap();
        let text = table.to_ffmetadata();
        assert!(text.starts_with(";FFMETADATA1\n"));
        assert_eq!(text.matches("[CHAPTER]").count(), 3);
        assert!(text.contains("START=600000\nEND=1500500\ntitle=1.1 Basics\n"));
    }

    #[test]
    fn ffmetadata_escapes_and_parses_back() {
        let items = [
            ("Q&A; part=1 #2", Duration::from_secs(5)),
            ("multi\nline \\ title", Duration::from_secs(7)),
        ];
        let table = ChapterPlanner.plan(&items).unwrap();
        let text = table.to_ffmetadata();
        assert!(text.contains(r"title=Q&A\; part\=1 \#2"));
        assert_eq!(ChapterTable::parse_ffmetadata(&text).unwrap(), table);
    }

    #[test]
    fn parser_converts_timebase_and_skips_global_tags() {
        let text = ";FFMETADATA1\ntitle=Book\nartist=Someone\n\n[CHAPTER]\nTIMEBASE=1/1000000\nSTART=0\nEND=2500000\ntitle=One\n[STREAM]\ntitle=ignored\n";
        let table = ChapterTable::parse_ffmetadata(text).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.chapters()[0].end_ms, 2_500);
        assert_eq!(table.chapters()[0].title, "One");
    }
}
