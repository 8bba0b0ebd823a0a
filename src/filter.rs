//! Composable search filters.
//!
//! A [`Filter`] is an immutable expression tree. Leaves compare a single
//! attribute; [`and`], [`or`] and [`not`] combine filters into new values
//! without touching their operands. Chains of the same boolean operator are
//! flattened, so `and(and(a, b), c)` and `and(a, and(b, c))` are the same
//! filter.
//!
//! Literal values are escaped when the filter is rendered into the string
//! syntax of RFC 4515. Rendering is also where malformed filters surface, as
//! [`Error::FilterSyntax`].
use crate::error::Error;

/// A search filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
	/// `(attr=value)`
	Equality {
		/// Attribute description
		attribute: String,
		/// Unescaped assertion value
		value: String,
	},
	/// `(attr=initial*any*final)`
	Substring {
		/// Attribute description
		attribute: String,
		/// Required prefix
		initial: Option<String>,
		/// Required infixes, in order
		any: Vec<String>,
		/// Required suffix
		last: Option<String>,
	},
	/// `(attr=*)`
	Present(String),
	/// `(attr>=value)`
	GreaterOrEqual {
		/// Attribute description
		attribute: String,
		/// Unescaped assertion value
		value: String,
	},
	/// `(attr<=value)`
	LessOrEqual {
		/// Attribute description
		attribute: String,
		/// Unescaped assertion value
		value: String,
	},
	/// `(attr~=value)`
	Approx {
		/// Attribute description
		attribute: String,
		/// Unescaped assertion value
		value: String,
	},
	/// All children must match
	And(Vec<Filter>),
	/// At least one child must match
	Or(Vec<Filter>),
	/// The child must not match
	Not(Box<Filter>),
	/// A caller-supplied filter string, passed through unescaped
	Raw(String),
}

/// Combine two filters with AND.
#[must_use]
pub fn and(left: Filter, right: Filter) -> Filter {
	let mut children = Vec::new();
	for filter in [left, right] {
		match filter {
			Filter::And(nested) => children.extend(nested),
			other => children.push(other),
		}
	}
	Filter::And(children)
}

/// Combine two filters with OR.
#[must_use]
pub fn or(left: Filter, right: Filter) -> Filter {
	let mut children = Vec::new();
	for filter in [left, right] {
		match filter {
			Filter::Or(nested) => children.extend(nested),
			other => children.push(other),
		}
	}
	Filter::Or(children)
}

/// Negate a filter. Negating a negation yields the original filter.
#[must_use]
pub fn not(filter: Filter) -> Filter {
	match filter {
		Filter::Not(inner) => *inner,
		other => Filter::Not(Box::new(other)),
	}
}

impl Filter {
	/// Exact match.
	#[must_use]
	pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Equality { attribute: attribute.into(), value: value.into() }
	}

	/// The attribute contains `value` anywhere.
	#[must_use]
	pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Substring {
			attribute: attribute.into(),
			initial: None,
			any: vec![value.into()],
			last: None,
		}
	}

	/// The attribute starts with `value`.
	#[must_use]
	pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Substring {
			attribute: attribute.into(),
			initial: Some(value.into()),
			any: Vec::new(),
			last: None,
		}
	}

	/// The attribute ends with `value`.
	#[must_use]
	pub fn ends_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Substring {
			attribute: attribute.into(),
			initial: None,
			any: Vec::new(),
			last: Some(value.into()),
		}
	}

	/// The attribute has at least one value.
	#[must_use]
	pub fn present(attribute: impl Into<String>) -> Self {
		Filter::Present(attribute.into())
	}

	/// The attribute has no value at all.
	#[must_use]
	pub fn absent(attribute: impl Into<String>) -> Self {
		not(Filter::present(attribute))
	}

	/// The attribute equals any of `values`. An empty list is rejected when
	/// the filter is rendered.
	#[must_use]
	pub fn any_of<I, S>(attribute: impl Into<String>, values: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let attribute = attribute.into();
		let mut alternatives: Vec<Filter> =
			values.into_iter().map(|value| Filter::eq(attribute.clone(), value)).collect();
		if alternatives.len() == 1 {
			return alternatives.swap_remove(0);
		}
		Filter::Or(alternatives)
	}

	/// Ordering match, `attribute >= value`.
	#[must_use]
	pub fn ge(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::GreaterOrEqual { attribute: attribute.into(), value: value.into() }
	}

	/// Ordering match, `attribute <= value`.
	#[must_use]
	pub fn le(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::LessOrEqual { attribute: attribute.into(), value: value.into() }
	}

	/// Approximate match, as the server defines it.
	#[must_use]
	pub fn approx(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Filter::Approx { attribute: attribute.into(), value: value.into() }
	}

	/// A filter already in string form. It is checked for balanced
	/// parentheses only; escaping is the caller's job.
	#[must_use]
	pub fn raw(filter: impl Into<String>) -> Self {
		Filter::Raw(filter.into())
	}

	/// `self AND other`.
	#[must_use]
	pub fn and(self, other: Filter) -> Self {
		and(self, other)
	}

	/// `self OR other`.
	#[must_use]
	pub fn or(self, other: Filter) -> Self {
		or(self, other)
	}

	/// `NOT self`.
	#[must_use]
	pub fn negate(self) -> Self {
		not(self)
	}

	/// Rename every attribute in the tree. Raw filters are left untouched.
	pub fn map_attributes<F>(&self, rename: &mut F) -> Result<Filter, Error>
	where
		F: FnMut(&str) -> Result<String, Error>,
	{
		Ok(match self {
			Filter::Equality { attribute, value } => {
				Filter::Equality { attribute: rename(attribute)?, value: value.clone() }
			}
			Filter::Substring { attribute, initial, any, last } => Filter::Substring {
				attribute: rename(attribute)?,
				initial: initial.clone(),
				any: any.clone(),
				last: last.clone(),
			},
			Filter::Present(attribute) => Filter::Present(rename(attribute)?),
			Filter::GreaterOrEqual { attribute, value } => {
				Filter::GreaterOrEqual { attribute: rename(attribute)?, value: value.clone() }
			}
			Filter::LessOrEqual { attribute, value } => {
				Filter::LessOrEqual { attribute: rename(attribute)?, value: value.clone() }
			}
			Filter::Approx { attribute, value } => {
				Filter::Approx { attribute: rename(attribute)?, value: value.clone() }
			}
			Filter::And(children) => Filter::And(
				children.iter().map(|child| child.map_attributes(rename)).collect::<Result<_, _>>()?,
			),
			Filter::Or(children) => Filter::Or(
				children.iter().map(|child| child.map_attributes(rename)).collect::<Result<_, _>>()?,
			),
			Filter::Not(child) => Filter::Not(Box::new(child.map_attributes(rename)?)),
			Filter::Raw(raw) => Filter::Raw(raw.clone()),
		})
	}

	/// Render into RFC 4515 string syntax.
	pub fn render(&self) -> Result<String, Error> {
		let mut out = String::new();
		self.write(&mut out)?;
		Ok(out)
	}

	/// Append the rendered filter to `out`.
	fn write(&self, out: &mut String) -> Result<(), Error> {
		match self {
			Filter::Equality { attribute, value } => comparison(out, attribute, "=", value),
			Filter::GreaterOrEqual { attribute, value } => comparison(out, attribute, ">=", value),
			Filter::LessOrEqual { attribute, value } => comparison(out, attribute, "<=", value),
			Filter::Approx { attribute, value } => comparison(out, attribute, "~=", value),
			Filter::Present(attribute) => {
				check_attribute(attribute)?;
				out.push('(');
				out.push_str(attribute);
				out.push_str("=*)");
				Ok(())
			}
			Filter::Substring { attribute, initial, any, last } => {
				check_attribute(attribute)?;
				out.push('(');
				out.push_str(attribute);
				out.push('=');
				if let Some(initial) = initial {
					escape_into(out, initial);
				}
				out.push('*');
				for part in any.iter().filter(|part| !part.is_empty()) {
					escape_into(out, part);
					out.push('*');
				}
				if let Some(last) = last {
					escape_into(out, last);
				}
				out.push(')');
				Ok(())
			}
			Filter::And(children) => composite(out, '&', children),
			Filter::Or(children) => composite(out, '|', children),
			Filter::Not(child) => {
				out.push_str("(!");
				child.write(out)?;
				out.push(')');
				Ok(())
			}
			Filter::Raw(raw) => {
				check_raw(raw)?;
				out.push_str(raw);
				Ok(())
			}
		}
	}
}

/// Write a simple `(attr<op>value)` item.
fn comparison(out: &mut String, attribute: &str, op: &str, value: &str) -> Result<(), Error> {
	check_attribute(attribute)?;
	out.push('(');
	out.push_str(attribute);
	out.push_str(op);
	escape_into(out, value);
	out.push(')');
	Ok(())
}

/// Write an AND or OR set.
fn composite(out: &mut String, op: char, children: &[Filter]) -> Result<(), Error> {
	if children.is_empty() {
		return Err(Error::FilterSyntax(format!("'{op}' needs at least one operand")));
	}
	out.push('(');
	out.push(op);
	for child in children {
		child.write(out)?;
	}
	out.push(')');
	Ok(())
}

/// Attribute descriptions are a descriptor or numeric OID, optionally followed
/// by `;options`.
fn check_attribute(attribute: &str) -> Result<(), Error> {
	let valid = attribute.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
		&& attribute.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ';'));
	if valid {
		Ok(())
	} else {
		Err(Error::FilterSyntax(format!("invalid attribute description '{attribute}'")))
	}
}

/// Cheap structural check for caller-supplied filter strings.
fn check_raw(raw: &str) -> Result<(), Error> {
	if !raw.starts_with('(') || !raw.ends_with(')') {
		return Err(Error::FilterSyntax(format!("'{raw}' is not parenthesized")));
	}
	let mut depth = 0_usize;
	for (index, c) in raw.char_indices() {
		match c {
			'(' => depth += 1,
			')' => {
				depth = depth
					.checked_sub(1)
					.ok_or_else(|| Error::FilterSyntax(format!("unbalanced ')' in '{raw}'")))?;
				if depth == 0 && index + 1 != raw.len() {
					return Err(Error::FilterSyntax(format!("trailing data in '{raw}'")));
				}
			}
			_ => {}
		}
	}
	if depth != 0 {
		return Err(Error::FilterSyntax(format!("unbalanced '(' in '{raw}'")));
	}
	Ok(())
}

/// Escape a literal assertion value.
#[must_use]
pub fn escape(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	escape_into(&mut out, value);
	out
}

/// Append `value` with the filter metacharacters hex-escaped.
fn escape_into(out: &mut String, value: &str) {
	for c in value.chars() {
		match c {
			'*' => out.push_str("\\2a"),
			'(' => out.push_str("\\28"),
			')' => out.push_str("\\29"),
			'\\' => out.push_str("\\5c"),
			'\0' => out.push_str("\\00"),
			c => out.push(c),
		}
	}
}
