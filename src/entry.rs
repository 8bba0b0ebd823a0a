//! Helper methods for extracting data from search results.
use ldap3::SearchEntry;

/// A directory entry as returned by a search: a DN plus a multi-valued
/// attribute map.
pub type Entry = SearchEntry;

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
pub trait SearchEntryExt {
	/// Get every value of an attribute. Attribute names are matched
	/// case-insensitively, as the directory does.
	fn attr_values(&self, attr: &str) -> Option<&[String]>;

	/// Get the first value of an attribute. Will return `None` if attribute
	/// value is not valid UTF-8.
	fn attr_first(&self, attr: &str) -> Option<&str> {
		self.attr_values(attr)?.first().map(String::as_str)
	}

	/// Whether the attribute is present with at least one value.
	fn has_attr(&self, attr: &str) -> bool {
		self.attr_values(attr).is_some_and(|values| !values.is_empty())
	}
}

impl SearchEntryExt for SearchEntry {
	fn attr_values(&self, attr: &str) -> Option<&[String]> {
		if let Some(values) = self.attrs.get(attr) {
			return Some(values);
		}
		self.attrs
			.iter()
			.find(|(name, _)| name.eq_ignore_ascii_case(attr))
			.map(|(_, values)| values.as_slice())
	}
}
