//! Deep-link routing.
//!
//! Recognized links:
//! - `storefront://orders/<id>`
//! - `storefront://payment/callback?order_id=..&order_number=..`
//!
//! The same paths are accepted under the web prefixes.

/// URL prefixes the app is registered for.
pub const DEEP_LINK_PREFIXES: [&str; 3] = [
    "storefront://",
    "https://shop.storefront.app/",
    "https://storefront.app/",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepLinkRoute {
    OrderDetail {
        order_id: Option<String>,
        order_number: Option<String>,
    },
    Unknown,
}

pub fn parse(url: &str) -> DeepLinkRoute {
    let Some(rest) = DEEP_LINK_PREFIXES
        .iter()
        .find_map(|prefix| url.strip_prefix(prefix))
    else {
        return DeepLinkRoute::Unknown;
    };

    let rest = rest.split('#').next().unwrap_or_default();
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["orders", id] => match decode(id) {
            Some(id) => DeepLinkRoute::OrderDetail {
                order_id: Some(id),
                order_number: None,
            },
            None => DeepLinkRoute::Unknown,
        },
        ["payment", "callback"] => {
            let order_id = query_param(query, "order_id");
            let order_number = query_param(query, "order_number");
            if order_id.is_none() && order_number.is_none() {
                log::warn!("Payment callback without order reference: {}", url);
                return DeepLinkRoute::Unknown;
            }
            DeepLinkRoute::OrderDetail {
                order_id,
                order_number,
            }
        }
        _ => DeepLinkRoute::Unknown,
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| decode(&value.replace('+', " ")))
}

fn decode(raw: &str) -> Option<String> {
    let decoded = urlencoding::decode(raw).ok()?;
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
