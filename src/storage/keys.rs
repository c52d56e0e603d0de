//! Index namespaces and item layouts.
//!
//! Every index item starts with a one-byte namespace prefix. Tenant-scoped
//! namespaces continue with the big-endian tenant, forming the 9-byte
//! common prefix; integers after it are big-endian as well, so byte order
//! equals numeric order within a namespace.
//!
//! | ns | relation             | layout after the common prefix          |
//! |----|----------------------|-----------------------------------------|
//! | 1  | tag → metricIDs      | tag, metricID*                          |
//! | 2  | metricID → TSID      | metricID, TSID                          |
//! | 3  | metricID → name      | metricID, name                          |
//! | 4  | deleted metricID     | (no tenant) metricID                    |
//! | 5  | date + metricID      | date, metricID                          |
//! | 6  | date + tag → IDs     | date, tag, metricID*                    |
//! | 7  | name → TSID          | name, `0x02`, TSID                      |
//! | 8  | date + name → TSID   | date, name, `0x02`, TSID                |
//!
//! `date` is days since the Unix epoch (UTC).

use chrono::DateTime;

use super::metric_name::{KV_SEPARATOR, MetricName, Tag};
use super::tsid::{Tenant, Tsid};

pub const NS_TAG_TO_METRIC_IDS: u8 = 1;
pub const NS_METRIC_ID_TO_TSID: u8 = 2;
pub const NS_METRIC_ID_TO_METRIC_NAME: u8 = 3;
pub const NS_DELETED_METRIC_ID: u8 = 4;
pub const NS_DATE_TO_METRIC_ID: u8 = 5;
pub const NS_DATE_TAG_TO_METRIC_IDS: u8 = 6;
pub const NS_METRIC_NAME_TO_TSID: u8 = 7;
pub const NS_DATE_METRIC_NAME_TO_TSID: u8 = 8;

/// Namespace byte plus big-endian tenant.
pub const COMMON_PREFIX_LEN: usize = 9;

/// Milliseconds per day.
pub const MS_PER_DAY: i64 = 86_400_000;

/// Day number of a millisecond timestamp; negative timestamps map to 0.
pub fn date_of(timestamp_ms: i64) -> u64 {
    timestamp_ms.div_euclid(MS_PER_DAY).max(0) as u64
}

/// `YYYY-MM-DD` rendering of a day number.
pub fn format_date(date: u64) -> String {
    let secs = i64::try_from(date)
        .ok()
        .and_then(|d| d.checked_mul(MS_PER_DAY / 1000));
    match secs.and_then(|s| DateTime::from_timestamp(s, 0)) {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => format!("day#{date}"),
    }
}

pub fn marshal_common_prefix(dst: &mut Vec<u8>, ns: u8, tenant: Tenant) {
    dst.push(ns);
    dst.extend_from_slice(&tenant.account_id.to_be_bytes());
    dst.extend_from_slice(&tenant.project_id.to_be_bytes());
}

pub fn common_prefix(ns: u8, tenant: Tenant) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMON_PREFIX_LEN);
    marshal_common_prefix(&mut out, ns, tenant);
    out
}

/// Tenant encoded in bytes `1..9` of a tenant-scoped item.
pub fn tenant_of(item: &[u8]) -> Option<Tenant> {
    let b = item.get(1..COMMON_PREFIX_LEN)?;
    Some(Tenant::new(
        u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
    ))
}

/// Big-endian `u64` at `offset`, if the item is long enough.
pub fn u64_at(item: &[u8], offset: usize) -> Option<u64> {
    let b = item.get(offset..offset + 8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    Some(u64::from_be_bytes(arr))
}

// ------------------------------------------------------------------------------------------------
// Item builders
// ------------------------------------------------------------------------------------------------

pub fn metric_id_to_tsid(tsid: &Tsid) -> Vec<u8> {
    let mut out = common_prefix(NS_METRIC_ID_TO_TSID, tsid.tenant());
    out.extend_from_slice(&tsid.metric_id.to_be_bytes());
    tsid.marshal(&mut out);
    out
}

pub fn metric_id_to_tsid_prefix(tenant: Tenant, metric_id: u64) -> Vec<u8> {
    let mut out = common_prefix(NS_METRIC_ID_TO_TSID, tenant);
    out.extend_from_slice(&metric_id.to_be_bytes());
    out
}

pub fn metric_id_to_metric_name(tsid: &Tsid, name: &MetricName) -> Vec<u8> {
    let mut out = metric_id_to_metric_name_prefix(tsid.tenant(), tsid.metric_id);
    name.marshal(&mut out);
    out
}

pub fn metric_id_to_metric_name_prefix(tenant: Tenant, metric_id: u64) -> Vec<u8> {
    let mut out = common_prefix(NS_METRIC_ID_TO_METRIC_NAME, tenant);
    out.extend_from_slice(&metric_id.to_be_bytes());
    out
}

pub fn tag_to_metric_ids_prefix(tenant: Tenant, tag: &Tag) -> Vec<u8> {
    let mut out = common_prefix(NS_TAG_TO_METRIC_IDS, tenant);
    tag.marshal(&mut out);
    out
}

pub fn tag_to_metric_id(tenant: Tenant, tag: &Tag, metric_id: u64) -> Vec<u8> {
    let mut out = tag_to_metric_ids_prefix(tenant, tag);
    out.extend_from_slice(&metric_id.to_be_bytes());
    out
}

pub fn deleted_metric_id(metric_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(NS_DELETED_METRIC_ID);
    out.extend_from_slice(&metric_id.to_be_bytes());
    out
}

pub fn date_prefix(ns: u8, tenant: Tenant, date: u64) -> Vec<u8> {
    let mut out = common_prefix(ns, tenant);
    out.extend_from_slice(&date.to_be_bytes());
    out
}

pub fn date_to_metric_id(tenant: Tenant, date: u64, metric_id: u64) -> Vec<u8> {
    let mut out = date_prefix(NS_DATE_TO_METRIC_ID, tenant, date);
    out.extend_from_slice(&metric_id.to_be_bytes());
    out
}

pub fn date_tag_to_metric_id(tenant: Tenant, date: u64, tag: &Tag, metric_id: u64) -> Vec<u8> {
    let mut out = date_prefix(NS_DATE_TAG_TO_METRIC_IDS, tenant, date);
    tag.marshal(&mut out);
    out.extend_from_slice(&metric_id.to_be_bytes());
    out
}

pub fn metric_name_to_tsid(tsid: &Tsid, name: &MetricName) -> Vec<u8> {
    let mut out = metric_name_to_tsid_prefix(tsid.tenant(), name);
    tsid.marshal(&mut out);
    out
}

/// Item prefix up to and including the separator before the TSID.
pub fn metric_name_to_tsid_prefix(tenant: Tenant, name: &MetricName) -> Vec<u8> {
    let mut out = common_prefix(NS_METRIC_NAME_TO_TSID, tenant);
    name.marshal(&mut out);
    out.push(KV_SEPARATOR);
    out
}

pub fn date_metric_name_to_tsid(date: u64, tsid: &Tsid, name: &MetricName) -> Vec<u8> {
    let mut out = date_prefix(NS_DATE_METRIC_NAME_TO_TSID, tsid.tenant(), date);
    name.marshal(&mut out);
    out.push(KV_SEPARATOR);
    tsid.marshal(&mut out);
    out
}

/// Every index item describing `tsid` named `name` with a sample on
/// `date`.
pub fn series_items(tsid: &Tsid, name: &MetricName, date: u64) -> Vec<Vec<u8>> {
    let tenant = tsid.tenant();
    let mut items = vec![
        metric_id_to_tsid(tsid),
        metric_id_to_metric_name(tsid, name),
        metric_name_to_tsid(tsid, name),
        date_to_metric_id(tenant, date, tsid.metric_id),
        date_metric_name_to_tsid(date, tsid, name),
    ];
    for tag in name.all_tags() {
        items.push(tag_to_metric_id(tenant, &tag, tsid.metric_id));
        items.push(date_tag_to_metric_id(tenant, date, &tag, tsid.metric_id));
    }
    items
}
