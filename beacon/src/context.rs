use http::HeaderMap;
use http::header::{HeaderName, USER_AGENT};

// Visitor location headers added by the Cloudflare edge in front of the relay.
const CF_IPCOUNTRY: HeaderName = HeaderName::from_static("cf-ipcountry");
const CF_IPCITY: HeaderName = HeaderName::from_static("cf-ipcity");
const CF_IPCONTINENT: HeaderName = HeaderName::from_static("cf-ipcontinent");
const CF_IPLATITUDE: HeaderName = HeaderName::from_static("cf-iplatitude");
const CF_IPLONGITUDE: HeaderName = HeaderName::from_static("cf-iplongitude");
const CF_POSTAL_CODE: HeaderName = HeaderName::from_static("cf-postal-code");
const CF_REGION: HeaderName = HeaderName::from_static("cf-region");
const CF_REGION_CODE: HeaderName = HeaderName::from_static("cf-region-code");
const CF_TIMEZONE: HeaderName = HeaderName::from_static("cf-timezone");
const CF_RAY: HeaderName = HeaderName::from_static("cf-ray");

/// Metadata about the visitor, supplied by the edge rather than the browser.
/// Every field is `None` when the edge did not provide a usable value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_agent: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub continent_code: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub postal_code: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub timezone: Option<String>,
    pub data_center_code: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &HeaderName| header_text(headers, name);

        RequestContext {
            user_agent: get(&USER_AGENT),
            country_code: get(&CF_IPCOUNTRY),
            city: get(&CF_IPCITY),
            continent_code: get(&CF_IPCONTINENT),
            latitude: get(&CF_IPLATITUDE),
            longitude: get(&CF_IPLONGITUDE),
            postal_code: get(&CF_POSTAL_CODE),
            region: get(&CF_REGION),
            region_code: get(&CF_REGION_CODE),
            timezone: get(&CF_TIMEZONE),
            data_center_code: get(&CF_RAY).as_deref().and_then(colo_from_ray),
        }
    }
}

/// Header value as text. City and region names may be UTF-8, so this does not
/// go through `HeaderValue::to_str`, which only accepts visible ASCII.
fn header_text(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let value = headers.get(name)?;
    let text = std::str::from_utf8(value.as_bytes()).ok()?.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

/// A ray id looks like `8f1c2d3e4a5b6c7d-SJC`; the suffix is the data center.
fn colo_from_ray(ray: &str) -> Option<String> {
    let (_, colo) = ray.rsplit_once('-')?;
    (!colo.is_empty()).then(|| colo.to_owned())
}
