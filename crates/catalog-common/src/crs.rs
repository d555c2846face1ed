//! Coordinate Reference System types and utilities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// EPSG codes treated as geographic (lat/lon in degrees).
const GEOGRAPHIC_CODES: &[u32] = &[4326, 4269, 4979, 4258, 6318, 7019];

/// A coordinate reference system attached to a dataset.
///
/// Catalog descriptors usually carry a bare EPSG code (`crs: 6344`), while
/// raster headers (VRT `<SRS>`, GeoTIFF citation) may carry WKT. WKT keeps the
/// EPSG authority code when one can be found in the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Crs {
    Epsg(u32),
    Wkt { wkt: String, epsg: Option<u32> },
}

impl Crs {
    /// Parse a CRS identifier.
    ///
    /// Accepts formats like:
    /// - "EPSG:6344" / "epsg:6344"
    /// - "6344"
    /// - "CRS:84" / "OGC:CRS84" (equivalent to EPSG:4326)
    /// - "urn:ogc:def:crs:EPSG::6344" / "urn:ogc:def:crs:OGC:1.3:CRS84"
    /// - WKT1 or WKT2 text
    pub fn parse(s: &str) -> Result<Self, CrsParseError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CrsParseError::Empty);
        }

        let upper = trimmed.to_uppercase();
        if upper == "CRS:84" || upper == "OGC:CRS84" {
            return Ok(Crs::Epsg(4326));
        }

        if let Some(rest) = upper.strip_prefix("URN:OGC:DEF:CRS:") {
            if rest.ends_with("CRS84") {
                return Ok(Crs::Epsg(4326));
            }
            // EPSG:<version>:<code>, version usually empty
            return match rest.split(':').collect::<Vec<_>>().as_slice() {
                ["EPSG", _, code] => code
                    .parse()
                    .map(Crs::Epsg)
                    .map_err(|_| CrsParseError::InvalidCode(trimmed.to_string())),
                _ => Err(CrsParseError::Unrecognized(trimmed.to_string())),
            };
        }

        if let Some(code) = upper.strip_prefix("EPSG:") {
            return code
                .trim()
                .parse()
                .map(Crs::Epsg)
                .map_err(|_| CrsParseError::InvalidCode(trimmed.to_string()));
        }

        if let Ok(code) = trimmed.parse::<u32>() {
            return Ok(Crs::Epsg(code));
        }

        if looks_like_wkt(&upper) {
            return Ok(Self::from_wkt(trimmed));
        }

        Err(CrsParseError::Unrecognized(trimmed.to_string()))
    }

    /// Wrap WKT text, extracting the top-level EPSG authority if present.
    pub fn from_wkt(wkt: &str) -> Self {
        Crs::Wkt {
            wkt: wkt.trim().to_string(),
            epsg: epsg_from_wkt(wkt),
        }
    }

    /// The EPSG code, when known.
    pub fn epsg(&self) -> Option<u32> {
        match self {
            Crs::Epsg(code) => Some(*code),
            Crs::Wkt { epsg, .. } => *epsg,
        }
    }

    /// Check if this is a geographic (lat/lon) CRS.
    pub fn is_geographic(&self) -> bool {
        match self {
            Crs::Epsg(code) => GEOGRAPHIC_CODES.contains(code),
            Crs::Wkt { wkt, epsg } => {
                if let Some(code) = epsg {
                    return GEOGRAPHIC_CODES.contains(code);
                }
                let upper = wkt.to_uppercase();
                upper.starts_with("GEOGCS") || upper.starts_with("GEOGCRS")
            }
        }
    }

    /// Two CRS are compatible when they resolve to the same EPSG code, or,
    /// lacking codes, when their WKT text is identical.
    pub fn is_compatible(&self, other: &Crs) -> bool {
        match (self.epsg(), other.epsg()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (Crs::Wkt { wkt: a, .. }, Crs::Wkt { wkt: b, .. }) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) | Crs::Wkt { epsg: Some(code), .. } => write!(f, "EPSG:{}", code),
            Crs::Wkt { wkt, epsg: None } => write!(f, "{}", wkt),
        }
    }
}

impl std::str::FromStr for Crs {
    type Err = CrsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Crs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Crs::Epsg(code) => serializer.serialize_u32(*code),
            Crs::Wkt { wkt, .. } => serializer.serialize_str(wkt),
        }
    }
}

impl<'de> Deserialize<'de> for Crs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Code(code) => Ok(Crs::Epsg(code)),
            Raw::Text(text) => Crs::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

fn looks_like_wkt(upper: &str) -> bool {
    [
        "PROJCS[", "GEOGCS[", "COMPD_CS[", "GEOCCS[", "PROJCRS[", "GEOGCRS[", "COMPOUNDCRS[",
        "BOUNDCRS[", "VERTCS[", "VERTCRS[",
    ]
    .iter()
    .any(|prefix| upper.starts_with(prefix))
}

/// Find the EPSG authority code of the outermost WKT node.
///
/// WKT1 writes `AUTHORITY["EPSG","6344"]` and WKT2 writes `ID["EPSG",6344]`.
/// Only an authority sitting directly inside the root element counts; codes
/// on nested datums, units or axes describe those parts, not the CRS.
fn epsg_from_wkt(wkt: &str) -> Option<u32> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut token_start = 0;
    let mut found = None;

    for (i, b) in wkt.bytes().enumerate() {
        if in_quote {
            in_quote = b != b'"';
            continue;
        }
        match b {
            b'"' => in_quote = true,
            b'[' | b'(' => {
                if depth == 1 {
                    let keyword = wkt[token_start..i].trim();
                    if keyword.eq_ignore_ascii_case("AUTHORITY") || keyword.eq_ignore_ascii_case("ID") {
                        if let Some(code) = epsg_authority(&wkt[i + 1..]) {
                            found = Some(code);
                        }
                    }
                }
                depth += 1;
                token_start = i + 1;
            }
            b']' | b')' => {
                depth = depth.saturating_sub(1);
                token_start = i + 1;
            }
            b',' => token_start = i + 1,
            _ => {}
        }
    }

    found
}

/// Code from the body of an authority node: `"EPSG","6344"]` or `"EPSG",6344]`.
fn epsg_authority(body: &str) -> Option<u32> {
    let body = &body[..body.find(|c| c == ']' || c == ')')?];
    let mut parts = body.split(',').map(|part| part.trim().trim_matches('"').trim());
    if !parts.next()?.eq_ignore_ascii_case("EPSG") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[derive(Debug, thiserror::Error)]
pub enum CrsParseError {
    #[error("empty CRS identifier")]
    Empty,

    #[error("invalid EPSG code: {0}")]
    InvalidCode(String),

    #[error("unrecognized CRS: {0}")]
    Unrecognized(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crs() {
        assert_eq!(Crs::parse("EPSG:6344").unwrap(), Crs::Epsg(6344));
        assert_eq!(Crs::parse("epsg:3857").unwrap(), Crs::Epsg(3857));
        assert_eq!(Crs::parse("5070").unwrap(), Crs::Epsg(5070));
        assert_eq!(Crs::parse("CRS:84").unwrap(), Crs::Epsg(4326));
        assert!(Crs::parse("EPSG:abc").is_err());
        assert!(Crs::parse("mercator-ish").is_err());
    }

    #[test]
    fn test_wkt1_outer_authority() {
        let wkt = r#"PROJCS["NAD83(2011) / UTM zone 15N",GEOGCS["NAD83(2011)",AUTHORITY["EPSG","6318"]],UNIT["metre",1],AUTHORITY["EPSG","6344"]]"#;
        let crs = Crs::parse(wkt).unwrap();
        assert_eq!(crs.epsg(), Some(6344));
        assert!(!crs.is_geographic());
        assert!(crs.is_compatible(&Crs::Epsg(6344)));
        assert_eq!(crs.to_string(), "EPSG:6344");
    }

    #[test]
    fn test_parse_urn() {
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG::6344").unwrap(), Crs::Epsg(6344));
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG:9.8:4269").unwrap(), Crs::Epsg(4269));
        assert_eq!(Crs::parse("urn:ogc:def:crs:OGC:1.3:CRS84").unwrap(), Crs::Epsg(4326));
        assert!(matches!(
            Crs::parse("urn:ogc:def:crs:EPSG::utm"),
            Err(CrsParseError::InvalidCode(_))
        ));
        assert!(Crs::parse("urn:ogc:def:crs:ESRI::102003").is_err());

        let from_yaml: Crs = serde_yaml::from_str("urn:ogc:def:crs:EPSG::6344").unwrap();
        assert_eq!(from_yaml, Crs::Epsg(6344));
    }

    #[test]
    fn test_wkt_nested_authority_is_not_the_crs() {
        let wkt = r#"PROJCS["custom",GEOGCS["NAD83",DATUM["North_American_Datum_1983",AUTHORITY["EPSG","6269"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]]],PROJECTION["Albers_Conic_Equal_Area"],UNIT["metre",1,AUTHORITY["EPSG","9001"]]]"#;
        let crs = Crs::parse(wkt).unwrap();
        assert_eq!(crs.epsg(), None);
        assert!(!crs.is_compatible(&Crs::Epsg(9001)));
        assert!(crs.to_string().starts_with("PROJCS["));

        let quoted = r#"PROJCS["odd, [name]",UNIT["metre",1],AUTHORITY["EPSG","5070"]]"#;
        assert_eq!(Crs::parse(quoted).unwrap().epsg(), Some(5070));
    }

    #[test]
    fn test_wkt2_id() {
        let wkt = r#"GEOGCRS["WGS 84",DATUM["World Geodetic System 1984"],ID["EPSG",4326]]"#;
        let crs = Crs::from_wkt(wkt);
        assert_eq!(crs.epsg(), Some(4326));
        assert!(crs.is_geographic());
    }

    #[test]
    fn test_compatibility() {
        assert!(Crs::Epsg(3857).is_compatible(&Crs::Epsg(3857)));
        assert!(!Crs::Epsg(3857).is_compatible(&Crs::Epsg(4326)));

        let custom = Crs::from_wkt(r#"LOCAL_CS["grid"]"#);
        assert!(!custom.is_compatible(&Crs::Epsg(4326)));
    }

    #[test]
    fn test_deserialize_code_or_string() {
        let from_int: Crs = serde_yaml::from_str("6344").unwrap();
        let from_str: Crs = serde_yaml::from_str("\"EPSG:6344\"").unwrap();
        assert_eq!(from_int, from_str);
    }
}
