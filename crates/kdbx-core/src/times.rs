//! `<Times>` block shared by groups and entries

use crate::dom::{self, XmlElement};
use crate::error::Result;
use crate::protected::XmlContext;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub creation_time: DateTime<Utc>,
    pub last_modification_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u64,
    pub location_changed: DateTime<Utc>,
}

impl Default for Times {
    fn default() -> Self {
        Self::now()
    }
}

impl Times {
    /// All timestamps set to the current second
    pub fn now() -> Self {
        let now = dom::now();
        Self {
            creation_time: now,
            last_modification_time: now,
            last_access_time: now,
            expiry_time: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    /// True if expiry is enabled and the expiry time has passed
    pub fn is_expired(&self) -> bool {
        self.expires && self.expiry_time < Utc::now()
    }

    pub fn touch(&mut self) {
        let now = dom::now();
        self.last_access_time = now;
        self.usage_count += 1;
    }

    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self> {
        let mut times = Self::now();
        for child in &element.children {
            let text = child.text.as_str();
            match child.name.as_str() {
                "CreationTime" => times.creation_time = dom::parse_datetime(text)?,
                "LastModificationTime" => times.last_modification_time = dom::parse_datetime(text)?,
                "LastAccessTime" => times.last_access_time = dom::parse_datetime(text)?,
                "ExpiryTime" => times.expiry_time = dom::parse_datetime(text)?,
                "Expires" => times.expires = dom::parse_bool(text)?,
                "UsageCount" => times.usage_count = dom::parse_number(text)?,
                "LocationChanged" => times.location_changed = dom::parse_datetime(text)?,
                other => tracing::debug!(element = other, "Ignoring unknown Times field"),
            }
        }
        Ok(times)
    }

    pub(crate) fn to_xml(&self, ctx: &XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("Times");
        element.push_text("CreationTime", ctx.format_date(&self.creation_time));
        element.push_text("LastModificationTime", ctx.format_date(&self.last_modification_time));
        element.push_text("LastAccessTime", ctx.format_date(&self.last_access_time));
        element.push_text("ExpiryTime", ctx.format_date(&self.expiry_time));
        element.push_text("Expires", dom::format_bool(self.expires));
        element.push_text("UsageCount", self.usage_count.to_string());
        element.push_text("LocationChanged", ctx.format_date(&self.location_changed));
        element
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::KdbxVersion;
    use crate::inner_stream::{InnerRandomStream, InnerStreamAlgorithm};
    use chrono::TimeZone;

    #[test]
    fn test_times_both_date_encodings() {
        let mut times = Times::now();
        times.expiry_time = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();
        times.expires = true;
        times.usage_count = 42;

        for version in [KdbxVersion::V3, KdbxVersion::V4] {
            let mut stream =
                InnerRandomStream::new(InnerStreamAlgorithm::Salsa20, &[0u8; 32]).unwrap();
            let ctx = XmlContext::new(version, &mut stream);
            let element = times.to_xml(&ctx);
            assert_eq!(Times::from_xml(&element).unwrap(), times, "{:?}", version);
        }
    }

    #[test]
    fn test_expiry() {
        let mut times = Times::now();
        times.expiry_time = Utc::now() - chrono::Duration::hours(1);
        assert!(!times.is_expired());
        times.expires = true;
        assert!(times.is_expired());
        times.expiry_time = Utc::now() + chrono::Duration::hours(1);
        assert!(!times.is_expired());
    }
}
