/// Capability descriptor advertised by the adapter.
///
/// Negotiated from two inputs only: whether values are serialized, and the
/// server version.
use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Array,
    Object,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatatypeSupport {
    Native,
    /// Stored, but read back as the given type.
    ConvertedTo(Datatype),
    /// Representable only through the serializer.
    RequiresSerializer,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metadata {
    Ttl,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capabilities {
    pub supported_datatypes: BTreeMap<Datatype, DatatypeSupport>,
    pub supported_metadata: Vec<Metadata>,
    pub min_ttl: u64,
    /// `0` means unlimited.
    pub max_ttl: u64,
    pub static_ttl: bool,
    pub ttl_precision: f64,
    pub use_request_time: bool,
    pub max_key_length: usize,
    pub namespace_is_prefix: bool,
}

impl Capabilities {
    pub fn negotiate(serializer: bool, redis_version: &str) -> Self {
        let before_v2 = version_lt(redis_version, (2, 0));

        Self {
            supported_datatypes: supported_datatypes(serializer),
            supported_metadata: if before_v2 { vec![] } else { vec![Metadata::Ttl] },
            min_ttl: if before_v2 { 0 } else { 1 },
            max_ttl: 0,
            static_ttl: true,
            ttl_precision: 1.0,
            use_request_time: false,
            max_key_length: 255,
            namespace_is_prefix: true,
        }
    }

    pub fn supports(&self, datatype: Datatype) -> bool {
        !matches!(
            self.supported_datatypes.get(&datatype),
            None | Some(DatatypeSupport::Unsupported)
        )
    }

    pub fn supports_ttl(&self) -> bool {
        self.supported_metadata.contains(&Metadata::Ttl)
    }
}

fn supported_datatypes(serializer: bool) -> BTreeMap<Datatype, DatatypeSupport> {
    use Datatype::*;
    use DatatypeSupport::*;

    if serializer {
        return BTreeMap::from([
            (Null, Native),
            (Boolean, Native),
            (Integer, Native),
            (Double, Native),
            (String, Native),
            (Array, RequiresSerializer),
            (Object, RequiresSerializer),
            (Resource, Unsupported),
        ]);
    }

    BTreeMap::from([
        (Null, ConvertedTo(String)),
        (Boolean, ConvertedTo(String)),
        (Integer, ConvertedTo(String)),
        (Double, ConvertedTo(String)),
        (String, Native),
        (Array, Unsupported),
        (Object, Unsupported),
        (Resource, Unsupported),
    ])
}

/// Leading `<major>.<minor>` of a version string. Missing parts read as zero.
fn parse_version(version: &str) -> (u64, u64) {
    let mut parts = version.split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().unwrap_or(0)
    });
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor)
}

fn version_lt(version: &str, than: (u64, u64)) -> bool {
    parse_version(version) < than
}
