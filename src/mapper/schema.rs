//! Declarations of how entries map onto records.
use std::{collections::HashSet, fmt, sync::Arc};

use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{
	config::TIME_FORMAT,
	error::Error,
	filter::{self, Filter},
};

/// How the values of an attribute are read into a field and written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
	/// The first value, as text
	Text,
	/// Every value, in server order
	List,
	/// An RFC 4517 boolean, `TRUE` or `FALSE`
	Bool,
	/// A boolean that is true when the attribute is present at all
	Flag,
	/// A GeneralizedTime timestamp in UTC
	Timestamp,
}

/// The value of a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
	/// No value; the attribute is absent
	Null,
	/// Text
	Text(String),
	/// Multiple values
	List(Vec<String>),
	/// A boolean
	Bool(bool),
	/// A point in time
	Time(OffsetDateTime),
}

impl Value {
	/// Whether the value would leave the attribute absent.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		match self {
			Value::Null => true,
			Value::Text(text) => text.is_empty(),
			Value::List(values) => values.is_empty(),
			Value::Bool(_) | Value::Time(_) => false,
		}
	}

	/// The text, if this is a text value.
	#[must_use]
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Value::Text(text) => Some(text),
			_ => None,
		}
	}

	/// The values, if this is a list.
	#[must_use]
	pub fn as_list(&self) -> Option<&[String]> {
		match self {
			Value::List(values) => Some(values),
			_ => None,
		}
	}

	/// The boolean, if this is one.
	#[must_use]
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(flag) => Some(*flag),
			_ => None,
		}
	}

	/// The timestamp, if this is one.
	#[must_use]
	pub fn as_time(&self) -> Option<OffsetDateTime> {
		match self {
			Value::Time(time) => Some(*time),
			_ => None,
		}
	}
}

impl From<&str> for Value {
	fn from(text: &str) -> Self {
		Value::Text(text.to_owned())
	}
}

impl From<String> for Value {
	fn from(text: String) -> Self {
		Value::Text(text)
	}
}

impl From<Vec<String>> for Value {
	fn from(values: Vec<String>) -> Self {
		Value::List(values)
	}
}

impl From<bool> for Value {
	fn from(flag: bool) -> Self {
		Value::Bool(flag)
	}
}

impl From<OffsetDateTime> for Value {
	fn from(time: OffsetDateTime) -> Self {
		Value::Time(time)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(value: Option<T>) -> Self {
		value.map_or(Value::Null, Into::into)
	}
}

impl Codec {
	/// The value of a field whose attribute is absent.
	#[must_use]
	pub fn empty(self) -> Value {
		match self {
			Codec::List => Value::List(Vec::new()),
			Codec::Flag => Value::Bool(false),
			Codec::Text | Codec::Bool | Codec::Timestamp => Value::Null,
		}
	}

	/// Read attribute values into a field value.
	pub fn decode(self, values: &[String]) -> Result<Value, Error> {
		let Some(first) = values.first() else {
			return Ok(self.empty());
		};
		match self {
			Codec::Text => Ok(Value::Text(first.clone())),
			Codec::List => Ok(Value::List(values.to_vec())),
			Codec::Flag => Ok(Value::Bool(true)),
			Codec::Bool => {
				if first.eq_ignore_ascii_case("TRUE") {
					Ok(Value::Bool(true))
				} else if first.eq_ignore_ascii_case("FALSE") {
					Ok(Value::Bool(false))
				} else {
					Err(Error::Invalid(format!("'{first}' is not a boolean")))
				}
			}
			Codec::Timestamp => PrimitiveDateTime::parse(first, TIME_FORMAT)
				.map(|time| Value::Time(time.assume_utc()))
				.map_err(|err| Error::Invalid(format!("'{first}' is not a timestamp: {err}"))),
		}
	}

	/// Write a field value as attribute values. An empty result means the
	/// attribute is absent.
	pub fn encode(self, value: &Value) -> Result<Vec<String>, Error> {
		Ok(match (self, value) {
			(_, Value::Null) | (Codec::Flag, Value::Bool(false)) => Vec::new(),
			(Codec::Text, Value::Text(text)) if text.is_empty() => Vec::new(),
			(Codec::Text, Value::Text(text)) => vec![text.clone()],
			(Codec::List, Value::List(values)) => values.clone(),
			(Codec::Bool, Value::Bool(flag)) => {
				vec![if *flag { "TRUE" } else { "FALSE" }.to_owned()]
			}
			(Codec::Flag, Value::Bool(true)) => vec!["TRUE".to_owned()],
			(Codec::Timestamp, Value::Time(time)) => vec![time
				.to_offset(UtcOffset::UTC)
				.format(TIME_FORMAT)
				.map_err(|err| Error::Invalid(err.to_string()))?],
			(codec, value) => {
				return Err(Error::Invalid(format!("{value:?} cannot be stored as {codec:?}")))
			}
		})
	}

	/// Bring a caller-supplied value into the shape this codec stores,
	/// rejecting values of the wrong kind.
	pub fn coerce(self, value: Value) -> Result<Value, Error> {
		match (self, value) {
			(codec, Value::Null) => Ok(codec.empty()),
			(Codec::Text, value @ Value::Text(_))
			| (Codec::List, value @ Value::List(_))
			| (Codec::Bool | Codec::Flag, value @ Value::Bool(_))
			| (Codec::Timestamp, value @ Value::Time(_)) => Ok(value),
			(Codec::List, Value::Text(text)) => Ok(Value::List(vec![text])),
			(codec, value) => Err(Error::Invalid(format!("{value:?} cannot be stored as {codec:?}"))),
		}
	}
}

/// A check a field value must pass before the record is saved. A failure
/// carries the message reported for the field.
#[derive(Clone)]
pub struct Validator {
	/// Shown in debug output
	name: &'static str,
	/// The check itself
	check: Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>,
}

impl Validator {
	/// A named custom check.
	pub fn new<F>(name: &'static str, check: F) -> Self
	where
		F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
	{
		Self { name, check: Arc::new(check) }
	}

	/// Reject values that would leave the attribute absent.
	#[must_use]
	pub fn not_empty() -> Self {
		Self::new("not_empty", |value| {
			if value.is_empty() {
				Err("the value must not be empty".to_owned())
			} else {
				Ok(())
			}
		})
	}

	/// Run `check` on every element of a list, or on a single text value.
	/// An absent value has no elements and passes.
	pub fn each<F>(check: F) -> Self
	where
		F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
	{
		Self::new("each", move |value| match value {
			Value::Null => Ok(()),
			Value::Text(text) => check(text),
			Value::List(values) => values.iter().map(String::as_str).try_for_each(&check),
			Value::Bool(_) | Value::Time(_) => Err("the value is not a list".to_owned()),
		})
	}

	/// Check `value`.
	pub fn check(&self, value: &Value) -> Result<(), String> {
		(self.check)(value)
	}
}

impl fmt::Debug for Validator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Validator").field(&self.name).finish()
	}
}

impl PartialEq for Validator {
	fn eq(&self, other: &Self) -> bool {
		self.name == other.name && Arc::ptr_eq(&self.check, &other.check)
	}
}

impl Eq for Validator {}

/// One record field backed by one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
	/// Name the record exposes
	pub name: String,
	/// Directory attribute it is stored in
	pub attribute: String,
	/// Value conversion
	pub codec: Codec,
	/// Whether saving requires a non-empty value
	pub required: bool,
	/// Value used when the attribute is absent
	pub default: Option<Value>,
	/// Further checks run on save, in order
	pub validators: Vec<Validator>,
}

impl Field {
	/// An optional field.
	#[must_use]
	pub fn new(name: impl Into<String>, attribute: impl Into<String>, codec: Codec) -> Self {
		Self {
			name: name.into(),
			attribute: attribute.into(),
			codec,
			required: false,
			default: None,
			validators: Vec::new(),
		}
	}

	/// Require a non-empty value on save.
	#[must_use]
	pub fn required(self) -> Self {
		Self { required: true, ..self }
	}

	/// Fill absent values with `value`.
	#[must_use]
	pub fn default(self, value: impl Into<Value>) -> Self {
		Self { default: Some(value.into()), ..self }
	}

	/// Add a check run on save.
	#[must_use]
	pub fn validator(mut self, validator: Validator) -> Self {
		self.validators.push(validator);
		self
	}

	/// The value of the field when its attribute is absent.
	#[must_use]
	pub fn absent_value(&self) -> Value {
		self.default.clone().unwrap_or_else(|| self.codec.empty())
	}
}

/// The mapping of one record type onto directory entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
	/// Record type name
	name: String,
	/// Entries live directly below this DN
	base_dn: String,
	/// Object classes every entry carries
	object_classes: Vec<String>,
	/// Field naming the entry within `base_dn`
	rdn: String,
	/// Declared fields
	fields: Vec<Field>,
	/// Keep unmapped attributes on load
	capture_extra: bool,
}

impl Schema {
	/// Start declaring a record type stored below `base_dn`.
	#[must_use]
	pub fn builder(name: impl Into<String>, base_dn: impl Into<String>) -> SchemaBuilder {
		SchemaBuilder {
			schema: Schema {
				name: name.into(),
				base_dn: base_dn.into(),
				object_classes: Vec::new(),
				rdn: String::new(),
				fields: Vec::new(),
				capture_extra: false,
			},
		}
	}

	/// Record type name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// DN entries are created below.
	#[must_use]
	pub fn base_dn(&self) -> &str {
		&self.base_dn
	}

	/// Object classes written on create.
	#[must_use]
	pub fn object_classes(&self) -> &[String] {
		&self.object_classes
	}

	/// Declared fields, in declaration order.
	#[must_use]
	pub fn fields(&self) -> &[Field] {
		&self.fields
	}

	/// Whether unmapped attributes are kept on load.
	#[must_use]
	pub fn captures_extra(&self) -> bool {
		self.capture_extra
	}

	/// The field naming entries.
	pub fn rdn_field(&self) -> Result<&Field, Error> {
		self.field(&self.rdn)
	}

	/// Look up a field by name.
	pub fn field(&self, name: &str) -> Result<&Field, Error> {
		self.fields
			.iter()
			.find(|field| field.name == name)
			.ok_or_else(|| Error::UnknownField(name.to_owned()))
	}

	/// Attribute backing the named field.
	pub fn attribute_of(&self, name: &str) -> Result<&str, Error> {
		Ok(&self.field(name)?.attribute)
	}

	/// Whether `attribute` is backed by a field.
	#[must_use]
	pub fn maps_attribute(&self, attribute: &str) -> bool {
		self.fields.iter().any(|field| field.attribute.eq_ignore_ascii_case(attribute))
	}

	/// Build the DN of an entry whose naming field holds `value`.
	pub fn dn_for(&self, value: &str) -> Result<String, Error> {
		Ok(format!("{}={},{}", self.rdn_field()?.attribute, escape_dn_value(value), self.base_dn))
	}

	/// Filter matching every entry of this type: one equality per object
	/// class.
	#[must_use]
	pub fn type_filter(&self) -> Option<Filter> {
		self.object_classes
			.iter()
			.map(|class| Filter::eq("objectClass", class.as_str()))
			.reduce(filter::and)
	}
}

/// Builds a [`Schema`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
	/// Schema under construction
	schema: Schema,
}

impl SchemaBuilder {
	/// Add an object class.
	#[must_use]
	pub fn object_class(mut self, class: impl Into<String>) -> Self {
		self.schema.object_classes.push(class.into());
		self
	}

	/// Declare a field.
	#[must_use]
	pub fn field(mut self, field: Field) -> Self {
		self.schema.fields.push(field);
		self
	}

	/// Name the field whose value forms the RDN.
	#[must_use]
	pub fn rdn(mut self, field: impl Into<String>) -> Self {
		self.schema.rdn = field.into();
		self
	}

	/// Keep attributes no field maps on load.
	#[must_use]
	pub fn capture_extra(mut self) -> Self {
		self.schema.capture_extra = true;
		self
	}

	/// Check the declarations and finish.
	pub fn build(self) -> Result<Schema, Error> {
		let mut schema = self.schema;
		let mut names = HashSet::new();
		for field in &mut schema.fields {
			if !names.insert(field.name.clone()) {
				return Err(Error::Invalid(format!(
					"Field '{}' declared twice in schema '{}'",
					field.name, schema.name
				)));
			}
			if let Some(default) = field.default.take() {
				field.default = Some(field.codec.coerce(default)?);
			}
		}
		let rdn = schema.field(&schema.rdn).map_err(|_| {
			Error::Invalid(format!("Schema '{}' has no RDN field '{}'", schema.name, schema.rdn))
		})?;
		if rdn.codec != Codec::Text {
			return Err(Error::Invalid(format!("RDN field '{}' must be text", rdn.name)));
		}
		Ok(schema)
	}
}

/// Escape an attribute value for use in a DN (RFC 4514).
#[must_use]
pub fn escape_dn_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let last = value.chars().count().saturating_sub(1);
	for (index, c) in value.chars().enumerate() {
		match c {
			',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
				out.push('\\');
				out.push(c);
			}
			'#' if index == 0 => out.push_str("\\#"),
			' ' if index == 0 || index == last => out.push_str("\\ "),
			'\0' => out.push_str("\\00"),
			c => out.push(c),
		}
	}
	out
}
