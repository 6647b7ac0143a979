//! Request analysis for WMS/WFS request strings.
//!
//! A stored test case keeps only the raw request (for example
//! `world.map?SERVICE=WMS&REQUEST=GetMap&FORMAT=image/png&...`). The
//! analyzer turns it into a [`Request`] with the service, request type,
//! output format and the common map parameters, plus a plausibility flag
//! saying whether the combination makes sense at all.

use serde::Serialize;
use std::fmt;

/// OGC service named by the `SERVICE=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Service {
    Wms,
    Wfs,
    Error,
}

/// Operation named by the `REQUEST=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestType {
    GetMap,
    GetCapabilities,
    GetFeatureInfo,
    DescribeFeatureType,
    GetFeature,
    #[serde(rename = "ERROR")]
    Error,
}

/// Output format named by the `FORMAT=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Png8,
    Gif,
    Error,
}

/// Bounding rectangle from the `BBOX=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Extent {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Extent {
    pub fn is_zero(&self) -> bool {
        *self == Extent::default()
    }
}

/// Immutable analysis of one request string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub service: Service,
    pub request_type: RequestType,
    pub format: ImageFormat,
    pub version: String,
    pub layers: Vec<String>,
    pub extent: Extent,
    /// Set when `BBOX=` was present but not four numbers; holds the
    /// offending value. The extent is zero in that case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extent_error: Option<String>,
    pub map_id: String,
    pub srs: String,
    pub is_plausible: bool,
    pub raw: String,
}

impl Request {
    /// Analyze `raw`. Never fails: anything unrecognized ends up as an
    /// `Error` variant and an implausible request.
    pub fn parse(raw: &str) -> Self {
        let params = QueryParams::new(raw);

        let service = parse_service(&params);
        let request_type = parse_request_type(&params);
        let format = parse_format(&params);

        let layers = params
            .value("layers")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let version = params.value("version").unwrap_or_default().to_string();

        let (extent, extent_error) = match params.value("bbox") {
            None => (Extent::default(), None),
            Some(value) => match parse_extent(value) {
                Some(extent) => (extent, None),
                None => (Extent::default(), Some(value.to_string())),
            },
        };

        let map_id = raw
            .find('.')
            .map(|idx| raw[..idx].to_string())
            .unwrap_or_default();

        let srs = if raw.to_ascii_lowercase().starts_with("srs=") {
            "None".to_string()
        } else {
            params
                .value("srs")
                .map(str::to_string)
                .unwrap_or_else(|| "None".to_string())
        };

        let is_plausible = extent_error.is_none()
            && is_plausible(service, request_type, format);

        Self {
            service,
            request_type,
            format,
            version,
            layers,
            extent,
            extent_error,
            map_id,
            srs,
            is_plausible,
            raw: raw.to_string(),
        }
    }

    /// Full URL for this request against a server prefix such as
    /// `http://localhost:8080/cgi-bin`.
    pub fn url(&self, prefix: &str) -> String {
        if self.raw.contains("://") || prefix.is_empty() {
            return self.raw.clone();
        }
        format!(
            "{}/{}",
            prefix.trim_end_matches('/'),
            self.raw.trim_start_matches('/')
        )
    }
}

/// Shorthand for [`Request::parse`].
pub fn parse(raw: &str) -> Request {
    Request::parse(raw)
}

/// Decoded `key=value` pairs of a request string. Keys are lowercased,
/// values keep their case.
struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    fn new(raw: &str) -> Self {
        let query = match raw.find('?') {
            Some(idx) => &raw[idx + 1..],
            None => raw,
        };
        let pairs = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        Self { pairs }
    }

    /// First value for `key`.
    fn value(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, lowercased.
    fn values_lower<'a>(&'a self, key: &'a str) -> impl Iterator<Item = String> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.to_ascii_lowercase())
    }
}

fn parse_service(params: &QueryParams) -> Service {
    let mut wms = false;
    let mut wfs = false;
    for value in params.values_lower("service") {
        match value.as_str() {
            "wms" => wms = true,
            "wfs" => wfs = true,
            _ => {}
        }
    }
    match (wms, wfs) {
        (true, false) => Service::Wms,
        (false, true) => Service::Wfs,
        _ => Service::Error,
    }
}

fn parse_request_type(params: &QueryParams) -> RequestType {
    let matches: Vec<RequestType> = params
        .values_lower("request")
        .filter_map(|value| match value.as_str() {
            "getmap" | "map" => Some(RequestType::GetMap),
            "getcapabilities" | "capabilities" => {
                Some(RequestType::GetCapabilities)
            }
            "getfeatureinfo" => Some(RequestType::GetFeatureInfo),
            "describefeaturetype" => Some(RequestType::DescribeFeatureType),
            "getfeature" => Some(RequestType::GetFeature),
            _ => None,
        })
        .collect();
    exactly_one(matches).unwrap_or(RequestType::Error)
}

fn parse_format(params: &QueryParams) -> ImageFormat {
    let matches: Vec<ImageFormat> = params
        .values_lower("format")
        .filter_map(|value| {
            let value = value.as_str();
            if value == "image/jpeg" || value == "jpeg" {
                Some(ImageFormat::Jpeg)
            } else if value.starts_with("image/png;")
                || value.contains("8-bit")
                || value == "png8"
            {
                Some(ImageFormat::Png8)
            } else if value == "image/png" || value == "png" {
                Some(ImageFormat::Png)
            } else if value == "image/gif" || value == "gif" {
                Some(ImageFormat::Gif)
            } else {
                None
            }
        })
        .collect();
    exactly_one(matches).unwrap_or(ImageFormat::Error)
}

fn exactly_one<T>(mut matches: Vec<T>) -> Option<T> {
    if matches.len() == 1 {
        matches.pop()
    } else {
        None
    }
}

/// `xMin,yMin,xMax,yMax`, parsed with `.` as decimal separator.
fn parse_extent(value: &str) -> Option<Extent> {
    let coords = value
        .split(',')
        .map(|c| c.trim().parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    match coords.as_slice() {
        [x_min, y_min, x_max, y_max] => Some(Extent {
            x_min: *x_min,
            y_min: *y_min,
            x_max: *x_max,
            y_max: *y_max,
        }),
        _ => None,
    }
}

fn is_plausible(
    service: Service,
    request_type: RequestType,
    format: ImageFormat,
) -> bool {
    if service == Service::Error || request_type == RequestType::Error {
        return false;
    }
    let wrong_service = match service {
        Service::Wms => matches!(
            request_type,
            RequestType::GetFeature | RequestType::DescribeFeatureType
        ),
        Service::Wfs => matches!(
            request_type,
            RequestType::GetFeatureInfo | RequestType::GetMap
        ),
        Service::Error => true,
    };
    if wrong_service {
        return false;
    }
    // GetMap needs an image format, every other operation must not name one.
    (request_type == RequestType::GetMap) == (format != ImageFormat::Error)
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Service::Wms => "WMS",
            Service::Wfs => "WFS",
            Service::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestType::GetMap => "GetMap",
            RequestType::GetCapabilities => "GetCapabilities",
            RequestType::GetFeatureInfo => "GetFeatureInfo",
            RequestType::DescribeFeatureType => "DescribeFeatureType",
            RequestType::GetFeature => "GetFeature",
            RequestType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::Png8 => "PNG8",
            ImageFormat::Gif => "GIF",
            ImageFormat::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GETMAP: &str = "world.map?SERVICE=WMS&VERSION=1.1.1&REQUEST=GetMap\
        &LAYERS=countries,rivers&SRS=EPSG:4326&BBOX=-180,-90,180,90\
        &FORMAT=image/png&WIDTH=400&HEIGHT=200";

    #[test]
    fn test_parse_getmap() {
        let req = parse(GETMAP);
        assert_eq!(req.service, Service::Wms);
        assert_eq!(req.request_type, RequestType::GetMap);
        assert_eq!(req.format, ImageFormat::Png);
        assert_eq!(req.version, "1.1.1");
        assert_eq!(req.layers, vec!["countries", "rivers"]);
        assert_eq!(
            req.extent,
            Extent {
                x_min: -180.0,
                y_min: -90.0,
                x_max: 180.0,
                y_max: 90.0
            }
        );
        assert_eq!(req.map_id, "world");
        assert_eq!(req.srs, "EPSG:4326");
        assert!(req.is_plausible);
        assert_eq!(req.raw, GETMAP);
    }

    #[test]
    fn test_empty_request_is_all_error() {
        let req = parse("");
        assert_eq!(req.service, Service::Error);
        assert_eq!(req.request_type, RequestType::Error);
        assert_eq!(req.format, ImageFormat::Error);
        assert!(!req.is_plausible);
        assert!(req.layers.is_empty());
        assert!(req.version.is_empty());
        assert!(req.extent.is_zero());
        assert_eq!(req.map_id, "");
        assert_eq!(req.srs, "None");
    }

    #[test]
    fn test_both_services_is_error() {
        for raw in [
            "service=wms&service=wfs&request=getmap",
            "SERVICE=WFS&request=GetFeature&Service=Wms",
        ] {
            assert_eq!(parse(raw).service, Service::Error, "{raw}");
        }
        assert_eq!(parse("service=wfs").service, Service::Wfs);
    }

    #[test]
    fn test_request_type_aliases() {
        assert_eq!(parse("request=map").request_type, RequestType::GetMap);
        assert_eq!(
            parse("request=capabilities").request_type,
            RequestType::GetCapabilities
        );
        assert_eq!(
            parse("REQUEST=GetFeatureInfo").request_type,
            RequestType::GetFeatureInfo
        );
        assert_eq!(
            parse("request=DescribeFeatureType").request_type,
            RequestType::DescribeFeatureType
        );
        assert_eq!(
            parse("request=GetFeature").request_type,
            RequestType::GetFeature
        );
    }

    #[test]
    fn test_ambiguous_request_type_is_error() {
        assert_eq!(
            parse("request=getmap&request=getfeature").request_type,
            RequestType::Error
        );
        assert_eq!(parse("request=unknown").request_type, RequestType::Error);
    }

    #[test]
    fn test_single_format_token() {
        let cases = [
            ("format=image/jpeg", ImageFormat::Jpeg),
            ("format=jpeg", ImageFormat::Jpeg),
            ("format=image/png", ImageFormat::Png),
            ("FORMAT=PNG", ImageFormat::Png),
            ("format=image/png; mode=8-bit", ImageFormat::Png8),
            ("format=image%2Fpng%3B%20mode%3D8bit", ImageFormat::Png8),
            ("format=image/gif", ImageFormat::Gif),
            ("format=image%2Fgif", ImageFormat::Gif),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse(raw).format, expected, "{raw}");
        }
    }

    #[test]
    fn test_zero_or_many_formats_is_error() {
        assert_eq!(parse("service=wms").format, ImageFormat::Error);
        assert_eq!(parse("format=image/tiff").format, ImageFormat::Error);
        assert_eq!(
            parse("format=image/png&format=image/gif").format,
            ImageFormat::Error
        );
    }

    #[test]
    fn test_srs_absent_or_leading() {
        assert_eq!(parse("service=wms&request=getmap").srs, "None");
        assert_eq!(parse("SRS=EPSG:4326&service=wms").srs, "None");
        assert_eq!(parse("service=wms&srs=EPSG:3857").srs, "EPSG:3857");
    }

    #[test]
    fn test_map_id_without_dot_is_empty() {
        assert_eq!(parse("service=wms&request=getmap").map_id, "");
        assert_eq!(parse("roads.map?service=wms").map_id, "roads");
    }

    #[test]
    fn test_malformed_bbox_is_surfaced() {
        let req = parse(
            "m.map?service=wms&request=getmap&format=image/png&bbox=1,2,x,4",
        );
        assert!(req.extent.is_zero());
        assert_eq!(req.extent_error.as_deref(), Some("1,2,x,4"));
        assert!(!req.is_plausible);

        let short = parse("bbox=1,2,3");
        assert_eq!(short.extent_error.as_deref(), Some("1,2,3"));
    }

    #[test]
    fn test_plausibility_service_mismatch() {
        assert!(!parse("service=wms&request=getfeature").is_plausible);
        assert!(!parse("service=wms&request=describefeaturetype").is_plausible);
        assert!(
            !parse("service=wfs&request=getmap&format=image/png").is_plausible
        );
        assert!(!parse("service=wfs&request=getfeatureinfo").is_plausible);
        assert!(parse("service=wfs&request=getfeature").is_plausible);
        assert!(parse("service=wms&request=getcapabilities").is_plausible);
    }

    /// GetMap must carry an image format and nothing else may; a request
    /// violating either direction is implausible.
    #[test]
    fn test_plausibility_format_correlation() {
        assert!(!parse("service=wms&request=getmap").is_plausible);
        assert!(
            !parse("service=wms&request=getcapabilities&format=image/png")
                .is_plausible
        );
        assert!(parse("service=wms&request=getmap&format=image/gif").is_plausible);
    }

    #[test]
    fn test_url_join() {
        let req = parse("world.map?service=wms");
        assert_eq!(
            req.url("http://localhost:8080/wms/"),
            "http://localhost:8080/wms/world.map?service=wms"
        );
        let abs = parse("http://other/x.map?service=wms");
        assert_eq!(abs.url("http://localhost"), "http://other/x.map?service=wms");
    }
}
