//! Purpose limitations and the ISO-8601 periods they are expressed in.

use super::claim::GrantRef;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("period must start with 'P': {0}")]
    MissingDesignator(String),
    #[error("unexpected '{unit}' in period {input}")]
    UnexpectedUnit { input: String, unit: char },
    #[error("number without unit in period {0}")]
    DanglingNumber(String),
    #[error("period {0} has no components")]
    Empty(String),
    #[error("component out of range in period {0}")]
    Overflow(String),
}

/// A calendar duration such as `P1Y2M10DT2H30M`.
///
/// Years and months are kept apart from the fixed part so that adding one
/// month to January 31st lands on the end of February.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalendarPeriod {
    pub months: u32,
    pub days: u32,
    pub seconds: u64,
}

/// Largest fixed part a `chrono::Duration` can carry.
const MAX_SECONDS: u64 = (i64::MAX / 1000) as u64;

impl CalendarPeriod {
    pub fn add_to(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = start.checked_add_months(Months::new(self.months))?;
        let seconds = Duration::try_seconds(i64::try_from(self.seconds).ok()?)?;
        shifted
            .checked_add_signed(Duration::try_days(i64::from(self.days))?)?
            .checked_add_signed(seconds)
    }
}

impl FromStr for CalendarPeriod {
    type Err = PeriodError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let body = input
            .strip_prefix('P')
            .ok_or_else(|| PeriodError::MissingDesignator(input.to_string()))?;

        let overflow = || PeriodError::Overflow(input.to_string());
        let mut period = CalendarPeriod::default();
        let mut in_time = false;
        let mut number: Option<u64> = None;
        let mut components = 0;

        for c in body.chars() {
            if let Some(digit) = c.to_digit(10) {
                let n = number.unwrap_or(0);
                number = Some(
                    n.checked_mul(10)
                        .and_then(|n| n.checked_add(u64::from(digit)))
                        .ok_or_else(overflow)?,
                );
                continue;
            }
            if c == 'T' && !in_time && number.is_none() {
                in_time = true;
                continue;
            }

            let unexpected = || PeriodError::UnexpectedUnit {
                input: input.to_string(),
                unit: c,
            };
            let n = number.take().ok_or_else(unexpected)?;
            let small = |n: u64| u32::try_from(n).map_err(|_| overflow());

            match (in_time, c) {
                (false, 'Y') => {
                    period.months = small(n)?
                        .checked_mul(12)
                        .and_then(|m| m.checked_add(period.months))
                        .ok_or_else(overflow)?;
                }
                (false, 'M') => {
                    period.months = period.months.checked_add(small(n)?).ok_or_else(overflow)?;
                }
                (false, 'W') => {
                    period.days = small(n)?
                        .checked_mul(7)
                        .and_then(|d| d.checked_add(period.days))
                        .ok_or_else(overflow)?;
                }
                (false, 'D') => {
                    period.days = period.days.checked_add(small(n)?).ok_or_else(overflow)?;
                }
                (true, 'H' | 'M' | 'S') => {
                    let unit = match c {
                        'H' => 3600,
                        'M' => 60,
                        _ => 1,
                    };
                    period.seconds = n
                        .checked_mul(unit)
                        .and_then(|s| s.checked_add(period.seconds))
                        .filter(|s| *s <= MAX_SECONDS)
                        .ok_or_else(overflow)?;
                }
                _ => return Err(unexpected()),
            }
            components += 1;
        }

        if number.is_some() {
            return Err(PeriodError::DanglingNumber(input.to_string()));
        }
        if components == 0 {
            return Err(PeriodError::Empty(input.to_string()));
        }
        Ok(period)
    }
}

impl fmt::Display for CalendarPeriod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "P")?;
        let (years, months) = (self.months / 12, self.months % 12);
        if years > 0 {
            write!(f, "{}Y", years)?;
        }
        if months > 0 {
            write!(f, "{}M", months)?;
        }
        if self.days > 0 || (self.months == 0 && self.seconds == 0) {
            write!(f, "{}D", self.days)?;
        }
        if self.seconds > 0 {
            write!(f, "T{}S", self.seconds)?;
        }
        Ok(())
    }
}

/// Why, and for how long, a grant may hold on to data.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PurposeLimitation {
    pub purpose_limitation_id: Uuid,
    pub grant_kind: String,
    pub grant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(json)]
    pub data: serde_json::Value,
    pub notice_period: Option<String>,
    pub expiry_period: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PurposeLimitation {
    pub fn new(grant: GrantRef, input: CreatePurposeLimitation) -> Self {
        let now = Utc::now();
        Self {
            purpose_limitation_id: Uuid::new_v4(),
            grant_kind: grant.kind().to_string(),
            grant_id: grant.id(),
            name: input.name,
            description: input.description,
            data: input.data,
            notice_period: input.notice_period,
            expiry_period: input.expiry_period,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn grant(&self) -> Option<GrantRef> {
        GrantRef::from_parts(&self.grant_kind, self.grant_id)
    }

    /// Last moment the holder must be notified before data is removed.
    fn notice_deadline(&self, start: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, PeriodError> {
        resolve(self.notice_period.as_deref(), start)
    }

    fn expires_at(&self, start: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, PeriodError> {
        resolve(self.expiry_period.as_deref(), start)
    }

    /// Pin the periods to concrete deadlines, counted from when the limitation was attached.
    pub fn resolve(self) -> Result<ResolvedPurposeLimitation, PeriodError> {
        let start = self.created_utc;
        Ok(ResolvedPurposeLimitation {
            notice_deadline: self.notice_deadline(start)?,
            expires_at: self.expires_at(start)?,
            limitation: self,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPurposeLimitation {
    #[serde(flatten)]
    pub limitation: PurposeLimitation,
    pub notice_deadline: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn resolve(period: Option<&str>, start: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, PeriodError> {
    match period {
        None => Ok(None),
        Some(raw) => {
            let period: CalendarPeriod = raw.parse()?;
            period
                .add_to(start)
                .map(Some)
                .ok_or_else(|| PeriodError::Overflow(raw.to_string()))
        }
    }
}

fn validate_period(raw: &str) -> Result<(), ValidationError> {
    raw.parse::<CalendarPeriod>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("iso8601_period"))
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePurposeLimitation {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 2550))]
    pub description: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[validate(custom(function = "validate_period"))]
    pub notice_period: Option<String>,
    #[validate(custom(function = "validate_period"))]
    pub expiry_period: Option<String>,
}
