//! Insertion-order header map with case-insensitive lookup (§3). Used for
//! both HTTP/1 and HTTP/2 headers and for `HttpRequest`'s decoded query
//! parameters, both of which spec.md describes as an "insertion-order
//! mapping ... case-insensitive lookup" / "ordered multimap".

use serde::{Deserialize, Serialize};

/// An ordered multimap of name/value pairs. Names are compared
/// case-insensitively but stored with their original case.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push((name.into(), value.into()));
	}

	/// Returns the first value for `name`, case-insensitively.
	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.0
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// Returns every value for `name`, in insertion order.
	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
		self
			.0
			.iter()
			.filter(move |(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn contains(&self, name: &str) -> bool {
		self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
	}

	/// Removes every occurrence of `name` and pushes a single new value.
	pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
		let name = name.into();
		self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
		self.0.push((name, value.into()));
	}

	pub fn remove(&mut self, name: &str) {
		self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromIterator<(String, String)> for Headers {
	fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
		Headers(iter.into_iter().collect())
	}
}

impl IntoIterator for Headers {
	type Item = (String, String);
	type IntoIter = std::vec::IntoIter<(String, String)>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lookup_is_case_insensitive_but_preserves_original_case() {
		let mut h = Headers::new();
		h.push("Content-Type", "text/plain");
		assert_eq!(h.get("content-type"), Some("text/plain"));
		assert_eq!(h.iter().next().unwrap().0, "Content-Type");
	}

	#[test]
	fn duplicate_names_preserved_in_order() {
		let mut h = Headers::new();
		h.push("Set-Cookie", "a=1");
		h.push("Set-Cookie", "b=2");
		let all: Vec<_> = h.get_all("set-cookie").collect();
		assert_eq!(all, vec!["a=1", "b=2"]);
	}

	#[test]
	fn set_replaces_all_prior_values() {
		let mut h = Headers::new();
		h.push("X-Foo", "1");
		h.push("X-Foo", "2");
		h.set("x-foo", "3");
		assert_eq!(h.get_all("X-Foo").collect::<Vec<_>>(), vec!["3"]);
	}
}
