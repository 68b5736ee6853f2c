//! Due-date resolution.
//!
//! Backends report due dates either as absolute dates or as phrases like
//! "next Friday". Phrases are resolved against the transcript's own date, never
//! the wall clock, so the same transcript always yields the same date.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Weekday};

/// Resolve a due-date expression relative to `reference`.
///
/// Returns `None` for anything unrecognized.
pub fn resolve(phrase: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let raw = phrase.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(date) = parse_absolute(raw) {
        return Some(date);
    }

    let normalized = normalize(raw);
    let text = strip_prefixes(&normalized);

    match text {
        "today" | "tonight" | "this evening" | "this afternoon" | "this morning" | "now" => {
            return Some(reference)
        }
        "tomorrow" | "tomorrow morning" | "tomorrow evening" => {
            return reference.checked_add_days(Days::new(1))
        }
        "day after tomorrow" | "the day after tomorrow" => {
            return reference.checked_add_days(Days::new(2))
        }
        "next week" => return reference.checked_add_days(Days::new(7)),
        "end of week" | "end of the week" | "this week" => {
            return upcoming(reference, Weekday::Fri, true)
        }
        "next month" => return first_of_next_month(reference),
        "end of month" | "end of the month" | "this month" => return last_of_month(reference),
        _ => {}
    }

    if let Some(date) = parse_weekday(text, reference) {
        return Some(date);
    }
    if let Some(date) = parse_offset(text, reference) {
        return Some(date);
    }
    parse_month_day(text, reference)
}

/// ISO `YYYY-MM-DD` or an RFC 3339 instant
fn parse_absolute(text: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.date_naive());
    }
    None
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .replace(',', " ")
        .split_whitespace()
        .map(|w| w.trim_end_matches(['.', '!', '?']))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_prefixes(mut text: &str) -> &str {
    for prefix in ["due ", "by ", "on ", "before ", "until "] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest;
        }
    }
    text
}

/// Next `target` after `reference`; `inclusive` also accepts `reference` itself
fn upcoming(reference: NaiveDate, target: Weekday, inclusive: bool) -> Option<NaiveDate> {
    let current = reference.weekday().num_days_from_monday();
    let wanted = target.num_days_from_monday();
    let mut days_ahead = (wanted + 7 - current) % 7;
    if days_ahead == 0 && !inclusive {
        days_ahead = 7;
    }
    reference.checked_add_days(Days::new(u64::from(days_ahead)))
}

fn first_of_next_month(reference: NaiveDate) -> Option<NaiveDate> {
    reference
        .with_day(1)?
        .checked_add_months(Months::new(1))
}

fn last_of_month(reference: NaiveDate) -> Option<NaiveDate> {
    first_of_next_month(reference)?.pred_opt()
}

fn weekday_from(word: &str) -> Option<Weekday> {
    match word {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// `friday`, `this friday`, `next friday`: the next occurrence strictly after the reference
fn parse_weekday(text: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let word = text
        .strip_prefix("next ")
        .or_else(|| text.strip_prefix("this "))
        .or_else(|| text.strip_prefix("coming "))
        .unwrap_or(text);
    weekday_from(word).and_then(|day| upcoming(reference, day, false))
}

fn number_from(word: &str) -> Option<u32> {
    if let Ok(n) = word.parse::<u32>() {
        return Some(n);
    }
    let n = match word {
        "a" | "an" | "one" => 1,
        "two" | "couple" => 2,
        "three" | "few" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "fourteen" => 14,
        "thirty" => 30,
        _ => return None,
    };
    Some(n)
}

/// `in 3 days`, `in two weeks`, `in a month`
///
/// Counts come from model output, so anything past the calendar's range is
/// left unresolved rather than overflowing.
fn parse_offset(text: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let rest = text.strip_prefix("in ")?;
    let words: Vec<&str> = rest
        .split_whitespace()
        .filter(|w| *w != "of")
        .collect();
    let (count, unit) = match words.as_slice() {
        [n, unit] => (number_from(n)?, *unit),
        ["a", "couple", unit] => (2, *unit),
        [_, n, unit] if *n == "couple" || *n == "few" => (number_from(n)?, *unit),
        _ => return None,
    };

    match unit.trim_end_matches('s') {
        "day" => reference.checked_add_days(Days::new(u64::from(count))),
        "week" => reference.checked_add_days(Days::new(u64::from(count) * 7)),
        "month" => reference.checked_add_months(Months::new(count)),
        _ => None,
    }
}

fn month_from(word: &str) -> Option<u32> {
    let month = match word {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" | "sept" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn day_from(word: &str) -> Option<u32> {
    let digits = word
        .trim_end_matches("st")
        .trim_end_matches("nd")
        .trim_end_matches("rd")
        .trim_end_matches("th");
    digits.parse::<u32>().ok().filter(|d| (1..=31).contains(d))
}

/// `march 3`, `march 3rd 2026`, `3 march`; without a year, the next such date on or after the reference
fn parse_month_day(text: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let words: Vec<&str> = text
        .split_whitespace()
        .filter(|w| *w != "the" && *w != "of")
        .collect();

    let (month, day, year) = match words.as_slice() {
        [m, d] if month_from(m).is_some() => (month_from(m)?, day_from(d)?, None),
        [d, m] if month_from(m).is_some() => (month_from(m)?, day_from(d)?, None),
        [m, d, y] if month_from(m).is_some() => (month_from(m)?, day_from(d)?, Some(y.parse().ok()?)),
        [d, m, y] if month_from(m).is_some() => (month_from(m)?, day_from(d)?, Some(y.parse().ok()?)),
        _ => return None,
    };

    match year {
        Some(year) => NaiveDate::from_ymd_opt(year, month, day),
        None => {
            let this_year = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
            if this_year >= reference {
                Some(this_year)
            } else {
                NaiveDate::from_ymd_opt(reference.year() + 1, month, day)
            }
        }
    }
}
