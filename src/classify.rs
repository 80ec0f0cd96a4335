//! URL templates and one-time classification of inbound change items.
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{ChangeBatch, ChangeItem, HttpMethod, Transition};

/// A path pattern such as `/swapRequests/{id}`, matched against the tail of a URL.
#[derive(Debug)]
pub struct UrlTemplate {
    regex: Regex,
}

impl UrlTemplate {
    pub fn new(pattern: &str) -> Self {
        let placeholder = Regex::new(r"\{(\w+)\}").expect("static placeholder regex");
        let mut source = String::from("^(?:.*?)");
        let mut last = 0;
        for caps in placeholder.captures_iter(pattern) {
            let whole = caps.get(0).expect("capture 0 always present");
            source.push_str(&regex::escape(&pattern[last..whole.start()]));
            source.push_str(&format!("(?P<{}>[^/?#]+)", &caps[1]));
            last = whole.end();
        }
        source.push_str(&regex::escape(&pattern[last..]));
        source.push_str("/?$");
        Self {
            regex: Regex::new(&source).expect("url template compiles"),
        }
    }

    /// Captured placeholders when `url` matches. Anything after `?` is ignored,
    /// which also tolerates unescaped date-times in the query string.
    pub fn captures(&self, url: &str) -> Option<HashMap<String, String>> {
        let path = strip_query(url);
        let caps = self.regex.captures(path)?;
        Some(
            self.regex
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect(),
        )
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(strip_query(url))
    }
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

static SWAP_REQUEST: Lazy<UrlTemplate> = Lazy::new(|| UrlTemplate::new("/swapRequests/{id}"));
static OPEN_SHIFT_REQUEST: Lazy<UrlTemplate> =
    Lazy::new(|| UrlTemplate::new("/openShiftRequests/{id}"));
static REQUESTABLE_SHIFTS: Lazy<UrlTemplate> =
    Lazy::new(|| UrlTemplate::new("/shifts/{id}/requestableShifts"));
static SHIFT: Lazy<UrlTemplate> = Lazy::new(|| UrlTemplate::new("/shifts/{id}"));
static OPEN_SHIFT: Lazy<UrlTemplate> = Lazy::new(|| UrlTemplate::new("/openShifts/{id}"));
static SHIFT_PREFERENCES: Lazy<UrlTemplate> =
    Lazy::new(|| UrlTemplate::new("/users/{userId}/settings/shiftPreferences"));

/// Query of an eligibility lookup, parsed leniently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibilityQuery {
    pub request_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl EligibilityQuery {
    pub fn parse(url: &str) -> Self {
        let Some((_, query)) = url.split_once('?') else {
            return Self::default();
        };
        let mut out = Self::default();
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "requesttype" => out.request_type = Some(value.to_string()),
                "starttime" => out.start = parse_loose_datetime(value),
                "endtime" => out.end = parse_loose_datetime(value),
                _ => {}
            }
        }
        out
    }
}

/// Accepts raw or percent-encoded RFC 3339, including a `+` offset that
/// arrived as a space.
fn parse_loose_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let decoded = raw
        .replace("%3A", ":")
        .replace("%3a", ":")
        .replace("%2B", "+")
        .replace("%2b", "+")
        .replace("%20", " ");
    let trimmed = decoded.trim_matches(|c| c == '\'' || c == '"');
    let candidates = [trimmed.to_string(), trimmed.replace(' ', "+")];
    candidates
        .iter()
        .find_map(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    SwapRequest { id: String },
    OpenShiftRequest { id: String },
    RequestableShifts { shift_id: String, query: EligibilityQuery },
    Shift { id: String },
    OpenShift { id: String },
    ShiftPreferences { user_id: String },
    Unknown,
}

impl Route {
    pub fn resolve(url: &str) -> Self {
        let capture = |template: &UrlTemplate, name: &str| {
            template
                .captures(url)
                .and_then(|mut caps| caps.remove(name))
        };
        if let Some(id) = capture(&*SWAP_REQUEST, "id") {
            return Route::SwapRequest { id };
        }
        if let Some(id) = capture(&*OPEN_SHIFT_REQUEST, "id") {
            return Route::OpenShiftRequest { id };
        }
        if let Some(shift_id) = capture(&*REQUESTABLE_SHIFTS, "id") {
            return Route::RequestableShifts {
                shift_id,
                query: EligibilityQuery::parse(url),
            };
        }
        if let Some(id) = capture(&*SHIFT, "id") {
            return Route::Shift { id };
        }
        if let Some(id) = capture(&*OPEN_SHIFT, "id") {
            return Route::OpenShift { id };
        }
        if let Some(user_id) = capture(&*SHIFT_PREFERENCES, "userId") {
            return Route::ShiftPreferences { user_id };
        }
        Route::Unknown
    }
}

/// A change item with its route and actor transition computed once.
#[derive(Debug, Clone)]
pub struct ClassifiedItem<'a> {
    pub index: usize,
    pub item: &'a ChangeItem,
    pub route: Route,
    pub transition: Option<Transition>,
}

impl<'a> ClassifiedItem<'a> {
    pub fn method(&self) -> HttpMethod {
        self.item.method
    }

    pub fn body(&self) -> Option<&'a Value> {
        self.item.body.as_ref()
    }

    pub fn is_swap_request(&self) -> bool {
        matches!(self.route, Route::SwapRequest { .. })
    }

    pub fn is_open_shift_request(&self) -> bool {
        matches!(self.route, Route::OpenShiftRequest { .. })
    }

    pub fn is_shift(&self) -> bool {
        matches!(self.route, Route::Shift { .. })
    }

    pub fn is_open_shift(&self) -> bool {
        matches!(self.route, Route::OpenShift { .. })
    }

    pub fn body_flag(&self, name: &str) -> bool {
        self.body()
            .and_then(|b| b.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn transition_of(item: &ChangeItem) -> Option<Transition> {
    let body = item.body.as_ref()?;
    let state = body.get("state").and_then(Value::as_str)?;
    let assigned_to = body.get("assignedTo").and_then(Value::as_str)?;
    Transition::from_fields(state, assigned_to)
}

pub fn classify(batch: &ChangeBatch) -> Vec<ClassifiedItem<'_>> {
    batch
        .requests
        .iter()
        .enumerate()
        .map(|(index, item)| ClassifiedItem {
            index,
            item,
            route: Route::resolve(&item.url),
            transition: transition_of(item),
        })
        .collect()
}
