// File: src/time_lib.rs
//
// IEC 61131 time library for the ST virtual machine.
// TIME values are unsigned milliseconds; DATE and TOD accessors decompose
// an epoch-millisecond TIME through chrono in UTC. Registered through the
// library-manager table and reached via CALL_LIBRARY indices resolved at
// generation time.

use crate::library::LibraryManager;
use crate::value::Value;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Process start instant backing `system_tick`
static START_INSTANT: Lazy<Instant> = Lazy::new(Instant::now);

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Milliseconds since the process started
pub fn uptime_ms() -> u64 {
    START_INSTANT.elapsed().as_millis() as u64
}

/// Register the time library functions; CALL_LIBRARY indices follow
/// registration order
pub fn register(mgr: &mut LibraryManager) {
    mgr.register_library("time_ms", 1, time_ms);
    mgr.register_library("time_s", 1, time_s);
    mgr.register_library("current_time", 0, current_time);
    mgr.register_library("system_tick", 0, system_tick);
    mgr.register_library("to_ms", 1, to_ms);
    mgr.register_library("to_s", 1, to_s);
    mgr.register_library("to_min", 1, to_min);
    mgr.register_library("to_hours", 1, to_hours);
    mgr.register_library("time_add", 2, time_add);
    mgr.register_library("time_sub", 2, time_sub);
    mgr.register_library("time_mul", 2, time_mul);
    mgr.register_library("time_div", 2, time_div);
    mgr.register_library("time_eq", 2, |a| time_cmp(a, |o| o == std::cmp::Ordering::Equal));
    mgr.register_library("time_ne", 2, |a| time_cmp(a, |o| o != std::cmp::Ordering::Equal));
    mgr.register_library("time_lt", 2, |a| time_cmp(a, |o| o == std::cmp::Ordering::Less));
    mgr.register_library("time_le", 2, |a| time_cmp(a, |o| o != std::cmp::Ordering::Greater));
    mgr.register_library("time_gt", 2, |a| time_cmp(a, |o| o == std::cmp::Ordering::Greater));
    mgr.register_library("time_ge", 2, |a| time_cmp(a, |o| o != std::cmp::Ordering::Less));
    mgr.register_library("date_year", 1, date_year);
    mgr.register_library("date_month", 1, date_month);
    mgr.register_library("date_day", 1, date_day);
    mgr.register_library("tod_hour", 1, tod_hour);
    mgr.register_library("tod_minute", 1, tod_minute);
    mgr.register_library("tod_second", 1, tod_second);
    mgr.register_library("time_to_string", 1, time_to_string);
}

fn expect_time(value: &Value, name: &str) -> Result<u64, String> {
    match value {
        Value::Time(ms) => Ok(*ms),
        other => Err(format!("{} expects a TIME argument, got {}", name, other.type_name())),
    }
}

fn expect_int(value: &Value, name: &str) -> Result<i32, String> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(format!("{} expects an INT argument, got {}", name, other.type_name())),
    }
}

// ---- constructors ----

fn time_ms(args: &[Value]) -> Result<Option<Value>, String> {
    let ms = expect_int(&args[0], "time_ms")?;
    if ms < 0 {
        return Err("time_ms expects a non-negative duration".into());
    }
    Ok(Some(Value::Time(ms as u64)))
}

fn time_s(args: &[Value]) -> Result<Option<Value>, String> {
    let seconds = expect_int(&args[0], "time_s")?;
    if seconds < 0 {
        return Err("time_s expects a non-negative duration".into());
    }
    (seconds as u64)
        .checked_mul(1000)
        .map(|ms| Some(Value::Time(ms)))
        .ok_or_else(|| "time_s overflow".to_string())
}

fn current_time(_args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Time(now_ms())))
}

fn system_tick(_args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Time(uptime_ms())))
}

// ---- unit conversions ----

fn to_ms(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::DInt(expect_time(&args[0], "to_ms")? as i64)))
}

fn to_s(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::DInt((expect_time(&args[0], "to_s")? / 1000) as i64)))
}

fn to_min(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::DInt((expect_time(&args[0], "to_min")? / 60_000) as i64)))
}

fn to_hours(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::DInt((expect_time(&args[0], "to_hours")? / 3_600_000) as i64)))
}

// ---- arithmetic ----

fn time_add(args: &[Value]) -> Result<Option<Value>, String> {
    let a = expect_time(&args[0], "time_add")?;
    let b = expect_time(&args[1], "time_add")?;
    a.checked_add(b).map(|ms| Some(Value::Time(ms))).ok_or_else(|| "time_add overflow".into())
}

fn time_sub(args: &[Value]) -> Result<Option<Value>, String> {
    let a = expect_time(&args[0], "time_sub")?;
    let b = expect_time(&args[1], "time_sub")?;
    a.checked_sub(b)
        .map(|ms| Some(Value::Time(ms)))
        .ok_or_else(|| "time_sub would produce a negative duration".into())
}

fn time_mul(args: &[Value]) -> Result<Option<Value>, String> {
    let a = expect_time(&args[0], "time_mul")?;
    let factor = expect_int(&args[1], "time_mul")?;
    if factor < 0 {
        return Err("time_mul expects a non-negative factor".into());
    }
    a.checked_mul(factor as u64)
        .map(|ms| Some(Value::Time(ms)))
        .ok_or_else(|| "time_mul overflow".into())
}

fn time_div(args: &[Value]) -> Result<Option<Value>, String> {
    let a = expect_time(&args[0], "time_div")?;
    let divisor = expect_int(&args[1], "time_div")?;
    if divisor <= 0 {
        return Err("time_div expects a positive divisor".into());
    }
    Ok(Some(Value::Time(a / divisor as u64)))
}

fn time_cmp(args: &[Value], accept: fn(std::cmp::Ordering) -> bool) -> Result<Option<Value>, String> {
    let a = expect_time(&args[0], "time comparison")?;
    let b = expect_time(&args[1], "time comparison")?;
    Ok(Some(Value::Bool(accept(a.cmp(&b)))))
}

// ---- date/time-of-day decomposition ----

fn decompose(args: &[Value], name: &str) -> Result<chrono::DateTime<Utc>, String> {
    let ms = expect_time(&args[0], name)?;
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .ok_or_else(|| format!("{}: TIME value out of datetime range", name))
}

fn date_year(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Int(decompose(args, "date_year")?.year())))
}

fn date_month(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Int(decompose(args, "date_month")?.month() as i32)))
}

fn date_day(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Int(decompose(args, "date_day")?.day() as i32)))
}

fn tod_hour(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Int(decompose(args, "tod_hour")?.hour() as i32)))
}

fn tod_minute(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Int(decompose(args, "tod_minute")?.minute() as i32)))
}

fn tod_second(args: &[Value]) -> Result<Option<Value>, String> {
    Ok(Some(Value::Int(decompose(args, "tod_second")?.second() as i32)))
}

fn time_to_string(args: &[Value]) -> Result<Option<Value>, String> {
    let ms = expect_time(&args[0], "time_to_string")?;
    Ok(Some(Value::String(format!("T#{}ms", ms))))
}
