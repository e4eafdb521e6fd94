use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case};
use nom::character::complete::{digit1, multispace0, space1};
use nom::combinator::{all_consuming, cut, map, map_res, value};
use nom::error::ParseError;
use nom::multi::separated_list1;
use nom::sequence::{delimited, pair, preceded, separated_pair};
use nom::{AsChar, IResult, InputTakeAtPosition, Parser};
use std::fmt;

// "daily 08:30" | "weekly mon,wed 08:30" | "monthly 31 08:30" | "once 2026-01-15 08:30"

/// When a schedule fires. Weekday indices run Sunday = 0 through Saturday = 6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Daily { at: NaiveTime },
    Weekly { weekdays: Vec<u8>, at: NaiveTime },
    Monthly { day: u32, at: NaiveTime },
    Once { at: NaiveDateTime },
}

impl Recurrence {
    pub fn parse(input: &str) -> Result<Self> {
        all_consuming(ws(alt((weekly, monthly, once, daily))))(input)
            .map_err(|e| match e {
                nom::Err::Incomplete(_) => anyhow!("Unexpected EOF in recurrence expression"),
                nom::Err::Error(f) | nom::Err::Failure(f) => {
                    let err_pos = input.len() - f.input.len();
                    anyhow!(
                        "Malformed recurrence expression at position {}\n{}\n{}^",
                        err_pos,
                        input,
                        " ".repeat(err_pos)
                    )
                }
            })
            .map(|(_, rule)| rule)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Recurrence::Daily { .. } => "daily",
            Recurrence::Weekly { .. } => "weekly",
            Recurrence::Monthly { .. } => "monthly",
            Recurrence::Once { .. } => "once",
        }
    }

    /// Next instant strictly after `now` at which the rule fires. Returns
    /// None when the rule can never fire again: an empty or out-of-range
    /// weekday set, or a day of month outside 1..=31.
    pub fn next_fire(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Recurrence::Daily { at } => {
                let today = now.date().and_time(*at);
                if today > now {
                    Some(today)
                } else {
                    Some(today + TimeDelta::days(1))
                }
            }
            Recurrence::Weekly { weekdays, at } => next_weekly(weekdays, *at, now),
            Recurrence::Monthly { day, at } => next_monthly(*day, *at, now),
            // The stored instant, no matter how often it is asked.
            Recurrence::Once { at } => Some(*at),
        }
    }
}

fn next_weekly(weekdays: &[u8], at: NaiveTime, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if weekdays.is_empty() || weekdays.iter().any(|d| *d > 6) {
        return None;
    }
    let current = i64::from(now.weekday().num_days_from_sunday());
    let mut best: Option<i64> = None;
    for &day in weekdays {
        let mut offset = (i64::from(day) + 7 - current) % 7;
        if offset == 0 && now.date().and_time(at) <= now {
            offset = 7;
        }
        best = Some(best.map_or(offset, |b: i64| b.min(offset)));
    }
    best.map(|days| (now.date() + TimeDelta::days(days)).and_time(at))
}

fn next_monthly(day: u32, at: NaiveTime, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if !(1..=31).contains(&day) {
        return None;
    }
    let mut year = now.year();
    let mut month = now.month();
    // The candidate one month ahead is always in the future, so two
    // rounds suffice. The bound only guards against a broken calendar.
    for _ in 0..24 {
        let clamped = day.min(days_in_month(year, month));
        let candidate = NaiveDate::from_ymd_opt(year, month, clamped)?.and_time(at);
        if candidate > now {
            return Some(candidate);
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    None
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first, next_first) {
        (Some(a), Some(b)) => b.signed_duration_since(a).num_days() as u32,
        _ => 0,
    }
}

pub fn weekday_name(day: u8) -> &'static str {
    match day {
        0 => "sun",
        1 => "mon",
        2 => "tue",
        3 => "wed",
        4 => "thu",
        5 => "fri",
        6 => "sat",
        _ => "?",
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Daily { at } => write!(f, "daily {}", at.format("%H:%M")),
            Recurrence::Weekly { weekdays, at } => {
                let names: Vec<&str> = weekdays.iter().map(|d| weekday_name(*d)).collect();
                write!(f, "weekly {} {}", names.join(","), at.format("%H:%M"))
            }
            Recurrence::Monthly { day, at } => {
                write!(f, "monthly {} {}", day, at.format("%H:%M"))
            }
            Recurrence::Once { at } => write!(f, "once {}", at.format("%Y-%m-%d %H:%M")),
        }
    }
}

fn daily(i: &str) -> IResult<&str, Recurrence> {
    map(
        preceded(pair(tag_no_case("daily"), space1), cut(time)),
        |at| Recurrence::Daily { at },
    )(i)
}

fn weekly(i: &str) -> IResult<&str, Recurrence> {
    map(
        preceded(
            pair(tag_no_case("weekly"), space1),
            cut(separated_pair(weekday_list, space1, time)),
        ),
        |(weekdays, at)| Recurrence::Weekly { weekdays, at },
    )(i)
}

fn monthly(i: &str) -> IResult<&str, Recurrence> {
    map(
        preceded(
            pair(tag_no_case("monthly"), space1),
            cut(separated_pair(day_of_month, space1, time)),
        ),
        |(day, at)| Recurrence::Monthly { day, at },
    )(i)
}

fn once(i: &str) -> IResult<&str, Recurrence> {
    map(
        preceded(
            pair(tag_no_case("once"), space1),
            cut(separated_pair(date, space1, time)),
        ),
        |(day, at)| Recurrence::Once { at: day.and_time(at) },
    )(i)
}

fn weekday_list(i: &str) -> IResult<&str, Vec<u8>> {
    map(separated_list1(ws(tag(",")), weekday), |mut days| {
        days.sort_unstable();
        days.dedup();
        days
    })(i)
}

fn weekday(i: &str) -> IResult<&str, u8> {
    alt((
        value(0, tag_no_case("sun")),
        value(1, tag_no_case("mon")),
        value(2, tag_no_case("tue")),
        value(3, tag_no_case("wed")),
        value(4, tag_no_case("thu")),
        value(5, tag_no_case("fri")),
        value(6, tag_no_case("sat")),
        map_res(digit1, |s: &str| match s.parse::<u8>() {
            Ok(n) if n <= 6 => Ok(n),
            _ => Err("weekday index out of range"),
        }),
    ))(i)
}

fn day_of_month(i: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| match s.parse::<u32>() {
        Ok(n) if (1..=31).contains(&n) => Ok(n),
        _ => Err("day of month out of range"),
    })(i)
}

fn time(i: &str) -> IResult<&str, NaiveTime> {
    map_res(separated_pair(number, tag(":"), number), |(h, m)| {
        NaiveTime::from_hms_opt(h, m, 0).ok_or("time of day out of range")
    })(i)
}

fn date(i: &str) -> IResult<&str, NaiveDate> {
    map_res(
        separated_pair(number, tag("-"), separated_pair(number, tag("-"), number)),
        |(y, (m, d))| NaiveDate::from_ymd_opt(y as i32, m, d).ok_or("invalid calendar date"),
    )(i)
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s| str::parse::<u32>(s))(input)
}

fn ws<I, O, E: ParseError<I>, F>(inner: F) -> impl FnMut(I) -> IResult<I, O, E>
where
    F: Parser<I, O, E>,
    I: InputTakeAtPosition,
    <I as InputTakeAtPosition>::Item: AsChar + Clone,
{
    delimited(multispace0, inner, multispace0)
}
