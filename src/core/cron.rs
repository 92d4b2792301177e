//! Five-field cron expression handling.
//!
//! Task records carry a standard five-field cron expression
//! (`minute hour day-of-month month day-of-week`). Shortcuts such as
//! `@daily` are expanded to their five-field form so the individual fields
//! stay addressable for re-display. Unparseable expressions never crash the
//! scheduler: [`CronExpression::parse_or_default`] falls back to the
//! documented default of running daily.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default expression used when a stored expression cannot be parsed.
pub const DEFAULT_EXPRESSION: &str = "@daily";

/// Errors that can occur when parsing a cron expression.
#[derive(Debug, Error)]
pub enum CronError {
    /// The expression could not be parsed.
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    /// The expression does not have exactly five fields.
    #[error("expected 5 cron fields, got {0}")]
    FieldCount(usize),

    /// Unknown `@` shortcut.
    #[error("unknown cron shortcut: {0}")]
    UnknownShortcut(String),
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    /// The expression as originally supplied (shortcuts preserved).
    expression: String,
    /// The five expanded fields: minute, hour, day-of-month, month, dow.
    fields: [String; 5],
    /// Parsed schedule (internally six-field with a zero seconds field).
    schedule: Schedule,
}

impl CronExpression {
    /// Parse a five-field cron expression or an `@` shortcut.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();

        let expanded = if trimmed.starts_with('@') {
            Self::expand_shortcut(trimmed)?
        } else {
            trimmed.to_string()
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        // The cron crate wants a seconds field in front.
        let schedule = Schedule::from_str(&format!("0 {}", expanded))
            .map_err(|e| CronError::InvalidExpression(e.to_string()))?;

        let fields = [
            parts[0].to_string(),
            parts[1].to_string(),
            parts[2].to_string(),
            parts[3].to_string(),
            parts[4].to_string(),
        ];

        Ok(Self {
            expression: trimmed.to_string(),
            fields,
            schedule,
        })
    }

    /// Parse an expression, falling back to [`DEFAULT_EXPRESSION`] when it
    /// is invalid. Invalid stored expressions must not take the scheduler
    /// down; they degrade to a daily run.
    pub fn parse_or_default(expression: &str) -> Self {
        match Self::parse(expression) {
            Ok(cron) => cron,
            Err(e) => {
                tracing::warn!(
                    expression,
                    error = %e,
                    "invalid cron expression, falling back to {}",
                    DEFAULT_EXPRESSION
                );
                Self::daily()
            }
        }
    }

    /// The default daily schedule (midnight).
    pub fn daily() -> Self {
        // A known-good constant; parsing cannot fail.
        Self::parse(DEFAULT_EXPRESSION).expect("default cron expression parses")
    }

    /// Build a literal one-off expression matching exactly the given local
    /// minute. Day-of-week is left as `*`; with minute, hour, day and month
    /// pinned the expression already selects a single minute.
    pub fn one_off(run_at: &DateTime<Tz>) -> Self {
        let expression = format!(
            "{} {} {} {} *",
            run_at.minute(),
            run_at.hour(),
            run_at.day(),
            run_at.month()
        );
        // All-numeric fields; parsing cannot fail.
        Self::parse(&expression).expect("literal one-off cron expression parses")
    }

    /// Expand an `@` shortcut into its five-field form.
    fn expand_shortcut(shortcut: &str) -> Result<String, CronError> {
        let expanded = match shortcut.to_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * SUN",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => return Err(CronError::UnknownShortcut(shortcut.to_string())),
        };
        Ok(expanded.to_string())
    }

    /// Next occurrence strictly after the given instant, evaluated in the
    /// given timezone and returned in UTC.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        self.schedule
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The expression as originally supplied.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The five expanded fields, for re-display.
    pub fn fields(&self) -> &[String; 5] {
        &self.fields
    }

    /// Minute field.
    pub fn minute(&self) -> &str {
        &self.fields[0]
    }

    /// Hour field.
    pub fn hour(&self) -> &str {
        &self.fields[1]
    }

    /// Day-of-month field.
    pub fn day_of_month(&self) -> &str {
        &self.fields[2]
    }

    /// Month field.
    pub fn month(&self) -> &str {
        &self.fields[3]
    }

    /// Day-of-week field.
    pub fn day_of_week(&self) -> &str {
        &self.fields[4]
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(" "))
    }
}

/// Resolve a configured timezone name, silently falling back to UTC when
/// the name is invalid. A bad timezone must never fail an enqueue.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::debug!(timezone = name, "invalid timezone, falling back to UTC");
            Tz::UTC
        }
    }
}
