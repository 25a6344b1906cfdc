// Shared data-stream encoding for the client protocol.
//
// All integers are fixed-width little-endian. Strings carry a u32 byte
// length (0xFFFFFFFF marks a null string) followed by UTF-16LE code units;
// byte arrays carry a u32 length (same null sentinel) followed by raw
// bytes. Timestamps are written as (Julian day, milliseconds of day,
// time-spec) with an optional UTC offset or zone identifier. Containers
// are a u32 element count followed by the elements.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

/// Length sentinel for null strings and null byte arrays.
const NULL_LENGTH: u32 = 0xFFFF_FFFF;

/// Julian day number of the Unix epoch (1970-01-01).
const EPOCH_JULIAN_DAY: i64 = 2_440_588;

fn need(buf: &impl Buf, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Protocol(format!(
            "truncated stream: needed {len} more bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool> {
    need(buf, 1)?;
    Ok(buf.get_u8() != 0)
}

pub fn put_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn put_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32_le(value);
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32_le(value);
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn put_i64(buf: &mut BytesMut, value: i64) {
    buf.put_i64_le(value);
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn put_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64_le(value);
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Strings are written as UTF-16LE with a byte-length prefix; `None` is the
/// null sentinel, distinct from the empty string.
pub fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        None => buf.put_u32_le(NULL_LENGTH),
        Some(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            buf.put_u32_le((units.len() * 2) as u32);
            for unit in units {
                buf.put_u16_le(unit);
            }
        }
    }
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_opt_string(buf, Some(value));
}

pub fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>> {
    let bytes = get_u32(buf)?;
    if bytes == NULL_LENGTH {
        return Ok(None);
    }
    if bytes % 2 != 0 {
        return Err(Error::Protocol(
            "corrupt stream: odd UTF-16 byte length".into(),
        ));
    }
    let len = (bytes / 2) as usize;
    need(buf, bytes as usize)?;
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(buf.get_u16_le());
    }
    String::from_utf16(&units)
        .map(Some)
        .map_err(|_| Error::Protocol("corrupt stream: invalid UTF-16 data".into()))
}

pub fn get_string(buf: &mut Bytes) -> Result<String> {
    Ok(get_opt_string(buf)?.unwrap_or_default())
}

pub fn put_opt_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        None => buf.put_u32_le(NULL_LENGTH),
        Some(data) => {
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(data);
        }
    }
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_opt_bytes(buf, Some(value));
}

pub fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Vec<u8>>> {
    let len = get_u32(buf)?;
    if len == NULL_LENGTH {
        return Ok(None);
    }
    need(buf, len as usize)?;
    let mut data = vec![0u8; len as usize];
    buf.copy_to_slice(&mut data);
    Ok(Some(data))
}

pub fn get_bytes(buf: &mut Bytes) -> Result<Vec<u8>> {
    Ok(get_opt_bytes(buf)?.unwrap_or_default())
}

pub fn put_string_list(buf: &mut BytesMut, values: &[String]) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        put_string(buf, value);
    }
}

pub fn get_string_list(buf: &mut Bytes) -> Result<Vec<String>> {
    let count = get_u32(buf)? as usize;
    let mut values = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        values.push(get_string(buf)?);
    }
    Ok(values)
}

pub fn put_bytes_list(buf: &mut BytesMut, values: &[Vec<u8>]) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        put_bytes(buf, value);
    }
}

pub fn get_bytes_list(buf: &mut Bytes) -> Result<Vec<Vec<u8>>> {
    let count = get_u32(buf)? as usize;
    let mut values = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        values.push(get_bytes(buf)?);
    }
    Ok(values)
}

pub fn put_i64_list(buf: &mut BytesMut, values: &[i64]) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        buf.put_i64_le(*value);
    }
}

pub fn get_i64_list(buf: &mut Bytes) -> Result<Vec<i64>> {
    let count = get_u32(buf)? as usize;
    let mut values = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        values.push(get_i64(buf)?);
    }
    Ok(values)
}

/// String-keyed map with byte-array values, written as count + pairs.
pub fn put_attribute_map(buf: &mut BytesMut, map: &[(String, Vec<u8>)]) {
    buf.put_u32_le(map.len() as u32);
    for (key, value) in map {
        put_string(buf, key);
        put_bytes(buf, value);
    }
}

pub fn get_attribute_map(buf: &mut Bytes) -> Result<Vec<(String, Vec<u8>)>> {
    let count = get_u32(buf)? as usize;
    let mut map = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_bytes(buf)?;
        map.push((key, value));
    }
    Ok(map)
}

/// How a timestamp's wall-clock value is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TimeSpec {
    Local = 0,
    Utc = 1,
    OffsetFromUtc = 2,
    TimeZone = 3,
}

/// A wire timestamp in one of its supported anchoring forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestamp {
    Utc(DateTime<Utc>),
    Offset(DateTime<FixedOffset>),
    /// Named-zone timestamps travel as local wall time plus the zone id;
    /// resolution of the id is left to the receiving side.
    Zoned(NaiveDateTime, Vec<u8>),
    Local(NaiveDateTime),
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::Utc(Utc::now())
    }

    /// Collapses to UTC where the anchoring allows it; named-zone and local
    /// timestamps are interpreted as UTC wall time.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            Timestamp::Utc(dt) => *dt,
            Timestamp::Offset(dt) => dt.with_timezone(&Utc),
            Timestamp::Zoned(naive, _) | Timestamp::Local(naive) => Utc.from_utc_datetime(naive),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::Utc(dt)
    }
}

fn split_naive(naive: &NaiveDateTime) -> (i64, i32) {
    let julian_day = i64::from(
        naive
            .date()
            .signed_duration_since(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
            .num_days() as i32,
    ) + EPOCH_JULIAN_DAY;
    let msecs = (naive.time().num_seconds_from_midnight() as i32) * 1000
        + (naive.time().nanosecond() / 1_000_000) as i32;
    (julian_day, msecs)
}

fn join_naive(julian_day: i64, msecs: i32) -> Result<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(1970, 1, 1)
        .unwrap()
        .checked_add_signed(Duration::days(julian_day - EPOCH_JULIAN_DAY))
        .ok_or_else(|| Error::Protocol("timestamp out of range".into()))?;
    if !(0..86_400_000).contains(&msecs) {
        return Err(Error::Protocol("timestamp ms-of-day out of range".into()));
    }
    Ok(date.and_time(
        chrono::NaiveTime::from_num_seconds_from_midnight_opt(
            (msecs / 1000) as u32,
            ((msecs % 1000) * 1_000_000) as u32,
        )
        .ok_or_else(|| Error::Protocol("timestamp ms-of-day out of range".into()))?,
    ))
}

pub fn put_datetime(buf: &mut BytesMut, value: &Timestamp) {
    let (naive, spec) = match value {
        Timestamp::Utc(dt) => (dt.naive_utc(), TimeSpec::Utc),
        Timestamp::Offset(dt) => (dt.naive_local(), TimeSpec::OffsetFromUtc),
        Timestamp::Zoned(naive, _) => (*naive, TimeSpec::TimeZone),
        Timestamp::Local(naive) => (*naive, TimeSpec::Local),
    };
    let (julian_day, msecs) = split_naive(&naive);
    buf.put_i64_le(julian_day);
    buf.put_i32_le(msecs);
    buf.put_u8(spec as u8);
    match value {
        Timestamp::Offset(dt) => buf.put_i32_le(dt.offset().local_minus_utc()),
        Timestamp::Zoned(_, zone_id) => put_bytes(buf, zone_id),
        _ => {}
    }
}

pub fn get_datetime(buf: &mut Bytes) -> Result<Timestamp> {
    let julian_day = get_i64(buf)?;
    let msecs = get_i32(buf)?;
    let spec = get_u8(buf)?;
    let naive = join_naive(julian_day, msecs)?;
    match spec {
        x if x == TimeSpec::Local as u8 => Ok(Timestamp::Local(naive)),
        x if x == TimeSpec::Utc as u8 => Ok(Timestamp::Utc(Utc.from_utc_datetime(&naive))),
        x if x == TimeSpec::OffsetFromUtc as u8 => {
            let offset = get_i32(buf)?;
            let tz = FixedOffset::east_opt(offset)
                .ok_or_else(|| Error::Protocol("invalid UTC offset".into()))?;
            // the stream carries local wall time plus the offset
            tz.from_local_datetime(&naive)
                .single()
                .map(Timestamp::Offset)
                .ok_or_else(|| Error::Protocol("ambiguous offset timestamp".into()))
        }
        x if x == TimeSpec::TimeZone as u8 => {
            let zone_id = get_bytes(buf)?;
            Ok(Timestamp::Zoned(naive, zone_id))
        }
        other => Err(Error::Protocol(format!("unknown time spec {other}"))),
    }
}
