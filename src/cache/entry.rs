//! Cache entry and expiry bookkeeping
//!
//! An entry moves through three windows:
//!
//! ```text
//!   created ──fresh──▶ eager_refresh_at ──fresh──▶ expires_at ──stale──▶ fail_safe_expires_at ──gone
//!                     (background refresh)                   (fail-safe only)
//! ```
//!
//! L2 stores entries in a small frame: `[u32 header len][JSON header][value]`.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::{EntryOptions, Priority};
use crate::error::{CacheError, Result};

/// Current wall clock in epoch milliseconds
#[inline]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
#[inline]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryHeader {
    created_at: u64,
    expires_at: u64,
    fail_safe_expires_at: u64,
    eager_refresh_at: Option<u64>,
    priority: Priority,
}

/// A stored value with its expiry windows. Timestamps are epoch millis.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Serialized envelope
    pub value: Bytes,
    pub created_at: u64,
    /// End of the fresh window
    pub expires_at: u64,
    /// End of the fail-safe window (equals `expires_at` without fail-safe)
    pub fail_safe_expires_at: u64,
    /// When a background refresh should start
    pub eager_refresh_at: Option<u64>,
    pub priority: Priority,
}

impl CacheEntry {
    /// Build an entry whose lifetime is `options.duration + jitter`
    pub fn new(value: Bytes, options: &EntryOptions, jitter: Duration, now: u64) -> Self {
        let lifetime = duration_millis(options.duration.saturating_add(jitter));
        let expires_at = now.saturating_add(lifetime);
        let fail_safe_expires_at = if options.fail_safe_enabled {
            expires_at.saturating_add(duration_millis(options.fail_safe_max_duration))
        } else {
            expires_at
        };
        let eager_refresh_at = options
            .eager_refresh_threshold
            .filter(|t| *t > 0.0 && *t < 1.0)
            .map(|t| now.saturating_add((lifetime as f64 * f64::from(t)).round() as u64));

        Self {
            value,
            created_at: now,
            expires_at,
            fail_safe_expires_at,
            eager_refresh_at,
            priority: options.priority,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Expired but still inside the fail-safe window
    #[inline]
    pub fn is_stale_usable(&self, now: u64) -> bool {
        now < self.fail_safe_expires_at
    }

    /// Past every window; safe to drop
    #[inline]
    pub fn is_dead(&self, now: u64) -> bool {
        now >= self.fail_safe_expires_at
    }

    #[inline]
    pub fn needs_eager_refresh(&self, now: u64) -> bool {
        !self.is_expired(now) && self.eager_refresh_at.is_some_and(|at| now >= at)
    }

    /// Physical time to live for remote storage
    pub fn physical_ttl(&self, now: u64) -> Duration {
        Duration::from_millis(self.fail_safe_expires_at.saturating_sub(now))
    }

    pub fn size(&self) -> usize {
        self.value.len()
    }

    /// Encode for L2 storage
    pub fn to_bytes(&self) -> Result<Bytes> {
        let header = EntryHeader {
            created_at: self.created_at,
            expires_at: self.expires_at,
            fail_safe_expires_at: self.fail_safe_expires_at,
            eager_refresh_at: self.eager_refresh_at,
            priority: self.priority,
        };
        let header = serde_json::to_vec(&header).map_err(|e| CacheError::Serialization {
            type_name: "CacheEntry".to_string(),
            source: e.into(),
        })?;

        let mut buf = BytesMut::with_capacity(4 + header.len() + self.value.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.value);
        Ok(buf.freeze())
    }

    /// Decode an L2 frame
    pub fn from_bytes(mut data: Bytes) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(frame_error("truncated entry frame"));
        }
        let header_len = data.get_u32() as usize;
        if data.remaining() < header_len {
            return Err(frame_error("entry header exceeds frame"));
        }
        let header_bytes = data.split_to(header_len);
        let header: EntryHeader =
            serde_json::from_slice(&header_bytes).map_err(|e| CacheError::Deserialization {
                type_name: "CacheEntry".to_string(),
                source: e.into(),
            })?;

        Ok(Self {
            value: data,
            created_at: header.created_at,
            expires_at: header.expires_at,
            fail_safe_expires_at: header.fail_safe_expires_at,
            eager_refresh_at: header.eager_refresh_at,
            priority: header.priority,
        })
    }
}

fn frame_error(message: &str) -> CacheError {
    use serde::de::Error as _;
    CacheError::Deserialization {
        type_name: "CacheEntry".to_string(),
        source: serde_json::Error::custom(message).into(),
    }
}
