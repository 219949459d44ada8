//! Predicate DSL over flows (§4.10), used both by the UI (bridge queries)
//! and internally wherever the rule engine's matchers find it convenient.
//! Pure functions over `&Flow` — no I/O, no mutation.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::flow::Flow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
	Equals,
	NotEquals,
	Contains,
	NotContains,
	StartsWith,
	EndsWith,
	Regex,
	GreaterThan,
	LessThan,
	GreaterOrEqual,
	LessOrEqual,
	Exists,
	NotExists,
	InList,
	NotInList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
	Url,
	Method,
	StatusCode,
	Host,
	Path,
	ContentType,
	RequestHeader,
	ResponseHeader,
	Tags,
	Notes,
	RequestBody,
	ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleFilter {
	pub field: Field,
	pub operator: Operator,
	/// Absent for `exists`/`not_exists`.
	pub value: Option<String>,
	/// Only meaningful when `field` is `RequestHeader`/`ResponseHeader`.
	pub header_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
	And,
	Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Filter {
	Simple(SimpleFilter),
	Combined { combinator: Combinator, filters: Vec<Filter> },
	QuickSearch { text: String },
}

fn field_value(flow: &Flow, field: Field, header_name: Option<&str>) -> Option<String> {
	match field {
		Field::Url => Some(flow.request.url.clone()),
		Field::Method => Some(flow.request.method.to_string()),
		Field::StatusCode => flow.response.as_ref().map(|r| r.status_code.to_string()),
		Field::Host => Some(flow.request.host.clone()),
		Field::Path => Some(flow.request.path.clone()),
		Field::ContentType => flow
			.response
			.as_ref()
			.and_then(|r| r.headers.get("content-type"))
			.or_else(|| flow.request.headers.get("content-type"))
			.map(str::to_owned),
		Field::RequestHeader => header_name.and_then(|n| flow.request.headers.get(n)).map(str::to_owned),
		Field::ResponseHeader => {
			header_name.and_then(|n| flow.response.as_ref().and_then(|r| r.headers.get(n))).map(str::to_owned)
		},
		Field::Tags => Some(flow.tags.join(",")),
		Field::Notes => flow.notes.clone(),
		Field::RequestBody => flow.request.body.as_ref().and_then(|b| b.text.clone()),
		Field::ResponseBody => flow.response.as_ref().and_then(|r| r.body.as_ref()).and_then(|b| b.text.clone()),
	}
}

fn eval_simple(flow: &Flow, f: &SimpleFilter) -> bool {
	let actual = field_value(flow, f.field, f.header_name.as_deref());

	if f.operator == Operator::Exists {
		return actual.is_some();
	}
	if f.operator == Operator::NotExists {
		return actual.is_none();
	}

	let Some(actual) = actual else { return false };
	let Some(expected) = &f.value else { return false };

	match f.operator {
		Operator::Equals => actual.eq_ignore_ascii_case(expected),
		Operator::NotEquals => !actual.eq_ignore_ascii_case(expected),
		Operator::Contains => actual.to_ascii_lowercase().contains(&expected.to_ascii_lowercase()),
		Operator::NotContains => !actual.to_ascii_lowercase().contains(&expected.to_ascii_lowercase()),
		Operator::StartsWith => actual.to_ascii_lowercase().starts_with(&expected.to_ascii_lowercase()),
		Operator::EndsWith => actual.to_ascii_lowercase().ends_with(&expected.to_ascii_lowercase()),
		Operator::Regex => Regex::new(expected).map(|re| re.is_match(&actual)).unwrap_or(false),
		Operator::GreaterThan | Operator::LessThan | Operator::GreaterOrEqual | Operator::LessOrEqual => {
			numeric_compare(f.operator, &actual, expected)
		},
		Operator::InList => list_contains(expected, &actual),
		Operator::NotInList => !list_contains(expected, &actual),
		Operator::Exists | Operator::NotExists => unreachable!("handled above"),
	}
}

fn numeric_compare(op: Operator, actual: &str, expected: &str) -> bool {
	let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) else {
		return false;
	};
	match op {
		Operator::GreaterThan => a > b,
		Operator::LessThan => a < b,
		Operator::GreaterOrEqual => a >= b,
		Operator::LessOrEqual => a <= b,
		_ => false,
	}
}

fn list_contains(csv: &str, needle: &str) -> bool {
	csv.split(',').any(|item| item.trim().eq_ignore_ascii_case(needle))
}

fn eval_quick_search(flow: &Flow, text: &str) -> bool {
	let needle = text.to_ascii_lowercase();
	let mut haystack = String::new();
	haystack.push_str(&flow.request.url);
	haystack.push(' ');
	haystack.push_str(&flow.request.method.to_string());
	if let Some(r) = &flow.response {
		haystack.push(' ');
		haystack.push_str(&r.status_code.to_string());
		if let Some(ct) = r.headers.get("content-type") {
			haystack.push(' ');
			haystack.push_str(ct);
		}
		if let Some(body) = &r.body {
			if let Some(t) = &body.text {
				haystack.push(' ');
				haystack.push_str(t);
			}
		}
	}
	haystack.push(' ');
	haystack.push_str(&flow.tags.join(" "));
	if let Some(notes) = &flow.notes {
		haystack.push(' ');
		haystack.push_str(notes);
	}
	if let Some(body) = &flow.request.body {
		if let Some(t) = &body.text {
			haystack.push(' ');
			haystack.push_str(t);
		}
	}
	haystack.to_ascii_lowercase().contains(&needle)
}

pub fn evaluate(flow: &Flow, filter: &Filter) -> bool {
	match filter {
		Filter::Simple(f) => eval_simple(flow, f),
		Filter::Combined { combinator, filters } => match combinator {
			Combinator::And => filters.iter().all(|f| evaluate(flow, f)),
			Combinator::Or => filters.iter().any(|f| evaluate(flow, f)),
		},
		Filter::QuickSearch { text } => eval_quick_search(flow, text),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::flow::{Body, Headers, HttpRequest, HttpResponse, Method, Protocol};
	use test_case::test_case;

	fn sample_flow(status: u16, path: &str) -> Flow {
		let request = HttpRequest {
			method: Method::Get,
			url: format!("http://example.test{path}"),
			scheme: "http".into(),
			host: "example.test".into(),
			port: 80,
			path: path.into(),
			query: None,
			params: Headers::new(),
			headers: Headers::new(),
			body: Some(Body::from_bytes(b"request body".as_slice().into())),
			content_length: None,
			timestamp: time::OffsetDateTime::now_utc(),
			is_secure: false,
		};
		let mut headers = Headers::new();
		headers.push("Content-Type", "application/json");
		let response = HttpResponse {
			status_code: status,
			status_message: "OK".into(),
			http_version: "HTTP/1.1".into(),
			headers,
			body: Some(Body::from_bytes(b"{\"ok\":true}".as_slice().into())),
			content_length: None,
			was_compressed: false,
			original_encoding: None,
			timestamp: time::OffsetDateTime::now_utc(),
			timing: None,
		};
		let mut flow = Flow::new(1, "s1".into(), request, Protocol::Http);
		flow.response = Some(response);
		flow
	}

	#[test_case(Operator::Equals, "GET", true)]
	#[test_case(Operator::Equals, "POST", false)]
	#[test_case(Operator::NotEquals, "POST", true)]
	fn method_equality_is_case_insensitive(op: Operator, value: &str, expected: bool) {
		let flow = sample_flow(200, "/");
		let filter = Filter::Simple(SimpleFilter {
			field: Field::Method,
			operator: op,
			value: Some(value.into()),
			header_name: None,
		});
		assert_eq!(evaluate(&flow, &filter), expected);
	}

	#[test]
	fn numeric_operator_on_status_code() {
		let flow = sample_flow(404, "/missing");
		let filter = Filter::Simple(SimpleFilter {
			field: Field::StatusCode,
			operator: Operator::GreaterOrEqual,
			value: Some("400".into()),
			header_name: None,
		});
		assert!(evaluate(&flow, &filter));
	}

	#[test]
	fn numeric_operator_on_non_numeric_field_is_false() {
		let flow = sample_flow(200, "/");
		let filter = Filter::Simple(SimpleFilter {
			field: Field::Method,
			operator: Operator::GreaterThan,
			value: Some("1".into()),
			header_name: None,
		});
		assert!(!evaluate(&flow, &filter));
	}

	#[test]
	fn combined_and_requires_all_filters() {
		let flow = sample_flow(200, "/api/v1");
		let filter = Filter::Combined {
			combinator: Combinator::And,
			filters: vec![
				Filter::Simple(SimpleFilter {
					field: Field::Path,
					operator: Operator::StartsWith,
					value: Some("/api".into()),
					header_name: None,
				}),
				Filter::Simple(SimpleFilter {
					field: Field::StatusCode,
					operator: Operator::Equals,
					value: Some("404".into()),
					header_name: None,
				}),
			],
		};
		assert!(!evaluate(&flow, &filter));
	}

	#[test]
	fn quick_search_matches_across_url_and_body() {
		let flow = sample_flow(200, "/widgets");
		assert!(evaluate(&flow, &Filter::QuickSearch { text: "widgets".into() }));
		assert!(evaluate(&flow, &Filter::QuickSearch { text: "\"ok\":true".into() }));
		assert!(!evaluate(&flow, &Filter::QuickSearch { text: "nonexistent".into() }));
	}

	#[test]
	fn exists_and_not_exists_on_missing_header() {
		let flow = sample_flow(200, "/");
		let exists = Filter::Simple(SimpleFilter {
			field: Field::ResponseHeader,
			operator: Operator::Exists,
			value: None,
			header_name: Some("x-missing".into()),
		});
		let not_exists = Filter::Simple(SimpleFilter {
			field: Field::ResponseHeader,
			operator: Operator::NotExists,
			value: None,
			header_name: Some("x-missing".into()),
		});
		assert!(!evaluate(&flow, &exists));
		assert!(evaluate(&flow, &not_exists));
	}
}
