//! Aggregations computed while draining a [`Cursor`](crate::query::Cursor).
use std::cmp::Ordering;

use crate::entry::{Entry, SearchEntryExt};

/// Folds search results into a single value.
pub trait Aggregation {
	/// Account for one entry.
	fn accumulate(&mut self, entry: &Entry);
}

/// Counts entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Count {
	/// Entries seen so far
	pub result: usize,
}

impl Aggregation for Count {
	fn accumulate(&mut self, _entry: &Entry) {
		self.result += 1;
	}
}

/// The largest value of an attribute across all entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Max {
	/// Attribute to inspect
	pub attribute: String,
	/// Largest value seen so far
	pub result: Option<String>,
}

impl Max {
	/// Track the largest value of `attribute`.
	#[must_use]
	pub fn new(attribute: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), result: None }
	}
}

impl Aggregation for Max {
	fn accumulate(&mut self, entry: &Entry) {
		fold(&mut self.result, entry, &self.attribute, Ordering::Greater);
	}
}

/// The smallest value of an attribute across all entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Min {
	/// Attribute to inspect
	pub attribute: String,
	/// Smallest value seen so far
	pub result: Option<String>,
}

impl Min {
	/// Track the smallest value of `attribute`.
	#[must_use]
	pub fn new(attribute: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), result: None }
	}
}

impl Aggregation for Min {
	fn accumulate(&mut self, entry: &Entry) {
		fold(&mut self.result, entry, &self.attribute, Ordering::Less);
	}
}

/// Replace `current` with every value of `attribute` that compares as
/// `wanted` against it.
fn fold(current: &mut Option<String>, entry: &Entry, attribute: &str, wanted: Ordering) {
	let Some(values) = entry.attr_values(attribute) else {
		return;
	};
	for value in values {
		let replace = match current.as_deref() {
			Some(best) => compare(value, best) == wanted,
			None => true,
		};
		if replace {
			*current = Some(value.clone());
		}
	}
}

/// Integers compare numerically, everything else lexically.
fn compare(left: &str, right: &str) -> Ordering {
	match (left.parse::<i64>(), right.parse::<i64>()) {
		(Ok(left), Ok(right)) => left.cmp(&right),
		_ => left.cmp(right),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use ldap3::SearchEntry;

	use super::{Aggregation, Count, Max, Min};

	fn entry(uid: &str, uid_number: Option<&str>) -> SearchEntry {
		let mut attrs = HashMap::from([(String::from("uid"), vec![uid.to_owned()])]);
		if let Some(number) = uid_number {
			attrs.insert(String::from("uidNumber"), vec![number.to_owned()]);
		}
		SearchEntry { dn: format!("uid={uid},ou=people,dc=example,dc=org"), attrs, bin_attrs: HashMap::new() }
	}

	fn run<A: Aggregation>(mut aggregation: A, entries: &[SearchEntry]) -> A {
		for entry in entries {
			aggregation.accumulate(entry);
		}
		aggregation
	}

	#[test]
	fn count() {
		let entries = [entry("a", None), entry("b", None), entry("c", None)];
		assert_eq!(run(Count::default(), &entries).result, 3);
		assert_eq!(run(Count::default(), &[]).result, 0);
	}

	#[test]
	fn numeric_values_compare_numerically() {
		let entries = [entry("a", Some("9")), entry("b", Some("1000")), entry("c", None), entry("d", Some("-4"))];
		assert_eq!(run(Max::new("uidNumber"), &entries).result.as_deref(), Some("1000"));
		assert_eq!(run(Min::new("uidNumber"), &entries).result.as_deref(), Some("-4"));
	}

	#[test]
	fn text_values_compare_lexically() {
		let entries = [entry("carol", None), entry("alice", None), entry("bob", None)];
		assert_eq!(run(Max::new("uid"), &entries).result.as_deref(), Some("carol"));
		assert_eq!(run(Min::new("UID"), &entries).result.as_deref(), Some("alice"));
		assert_eq!(run(Max::new("mail"), &entries).result, None);
	}
}
