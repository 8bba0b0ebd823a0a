//! Typed views of directory entries with change tracking.
use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use tracing::debug;

use super::schema::{Codec, Schema, Value};
use crate::{
	connection::Connection,
	entry::{Entry, SearchEntryExt},
	error::Error,
	protocol::Modification,
};

/// Where a record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
	/// Not yet in the directory
	Transient,
	/// In sync with the directory as of the last load or save
	Persisted,
	/// Changed locally since the last load or save
	Dirty,
	/// Deleted from the directory; every further operation fails
	Deleted,
}

/// An entry projected through a [`Schema`].
#[derive(Debug, Clone)]
pub struct Record {
	/// Mapping in use
	schema: Arc<Schema>,
	/// Distinguished name, once known
	dn: Option<String>,
	/// Current field values
	values: BTreeMap<String, Value>,
	/// Field values as last synced with the directory
	loaded: BTreeMap<String, Value>,
	/// Fields whose value differs from `loaded`
	dirty: BTreeSet<String>,
	/// Unmapped attributes, when the schema captures them
	extra: BTreeMap<String, Vec<String>>,
	/// Whether the entry exists in the directory
	persisted: bool,
	/// Set once the entry is deleted
	deleted: bool,
}

impl Record {
	/// A record to be added. Every field holds its default.
	#[must_use]
	pub fn new(schema: Arc<Schema>) -> Self {
		let values: BTreeMap<String, Value> =
			schema.fields().iter().map(|field| (field.name.clone(), field.absent_value())).collect();
		let loaded =
			schema.fields().iter().map(|field| (field.name.clone(), field.codec.empty())).collect();
		let mut record = Self {
			schema,
			dn: None,
			values,
			loaded,
			dirty: BTreeSet::new(),
			extra: BTreeMap::new(),
			persisted: false,
			deleted: false,
		};
		record.dirty = record.changed_fields();
		record
	}

	/// Project a fetched entry. Absent fields take their default; attributes
	/// without a field are dropped unless the schema captures them.
	pub fn load(schema: Arc<Schema>, entry: Entry) -> Result<Self, Error> {
		let mut values = BTreeMap::new();
		for field in schema.fields() {
			let value = match entry.attr_values(&field.attribute) {
				Some(raw) if !raw.is_empty() => field.codec.decode(raw).map_err(|err| {
					Error::Invalid(format!("{} of {}: {err}", field.name, entry.dn))
				})?,
				_ => field.absent_value(),
			};
			values.insert(field.name.clone(), value);
		}
		let extra = if schema.captures_extra() {
			entry.attrs.into_iter().filter(|(attr, _)| !schema.maps_attribute(attr)).collect()
		} else {
			BTreeMap::new()
		};
		Ok(Self {
			schema,
			dn: Some(entry.dn),
			loaded: values.clone(),
			values,
			dirty: BTreeSet::new(),
			extra,
			persisted: true,
			deleted: false,
		})
	}

	/// Use `dn` instead of deriving one from the naming field when the
	/// record is added.
	pub fn with_dn(mut self, dn: impl Into<String>) -> Result<Self, Error> {
		if self.persisted {
			return Err(Error::Invalid("The DN of a stored record cannot change".to_owned()));
		}
		self.dn = Some(dn.into());
		Ok(self)
	}

	/// The mapping this record follows.
	#[must_use]
	pub fn schema(&self) -> &Schema {
		&self.schema
	}

	/// The entry's DN, if known.
	#[must_use]
	pub fn dn(&self) -> Option<&str> {
		self.dn.as_deref()
	}

	/// Unmapped attributes captured on load.
	#[must_use]
	pub fn extra(&self) -> &BTreeMap<String, Vec<String>> {
		&self.extra
	}

	/// Current lifecycle state.
	#[must_use]
	pub fn state(&self) -> RecordState {
		if self.deleted {
			RecordState::Deleted
		} else if !self.persisted {
			RecordState::Transient
		} else if self.dirty.is_empty() {
			RecordState::Persisted
		} else {
			RecordState::Dirty
		}
	}

	/// Whether `field` has unsaved changes.
	#[must_use]
	pub fn is_dirty(&self, field: &str) -> bool {
		self.dirty.contains(field)
	}

	/// The value of a field.
	pub fn get(&self, field: &str) -> Result<&Value, Error> {
		self.ensure_usable()?;
		self.values.get(field).ok_or_else(|| Error::UnknownField(field.to_owned()))
	}

	/// The value of a text field, if set.
	pub fn text(&self, field: &str) -> Result<Option<&str>, Error> {
		Ok(self.get(field)?.as_text())
	}

	/// Change a field locally. Nothing is sent until [`Record::save`].
	pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), Error> {
		self.ensure_usable()?;
		let declared = self.schema.field(field)?;
		let value = declared.codec.coerce(value.into())?;
		let renames = self.schema.rdn_field()?.name == field && self.values.get(field) != Some(&value);
		if self.persisted && renames {
			return Err(Error::Invalid(format!("Field '{field}' names the entry and cannot change")));
		}
		if self.loaded.get(field) == Some(&value) {
			self.dirty.remove(field);
		} else {
			self.dirty.insert(field.to_owned());
		}
		self.values.insert(field.to_owned(), value);
		Ok(())
	}

	/// The attribute-level changes needed to bring the directory entry in
	/// line with this record.
	///
	/// Values appended to a list become an add of the new values, emptied
	/// fields delete the attribute, everything else is replaced.
	pub fn changes(&self) -> Result<Vec<Modification>, Error> {
		self.ensure_usable()?;
		let mut changes = Vec::new();
		for field in self.schema.fields().iter().filter(|field| self.dirty.contains(&field.name)) {
			let old = encode_field(&self.loaded, &field.name, field.codec)?;
			let new = encode_field(&self.values, &field.name, field.codec)?;
			if old == new {
				continue;
			}
			let attribute = field.attribute.clone();
			changes.push(if new.is_empty() {
				Modification::Delete(attribute, Vec::new())
			} else if field.codec == Codec::List && !old.is_empty() && new.starts_with(&old) {
				Modification::Add(attribute, new[old.len()..].to_vec())
			} else {
				Modification::Replace(attribute, new)
			});
		}
		Ok(changes)
	}

	/// Check required fields and run field validators, reporting every
	/// failing field at once. Each field reports its first failure.
	pub fn validate(&self) -> Result<(), Error> {
		self.ensure_usable()?;
		let mut failures = BTreeMap::new();
		let null = Value::Null;
		for field in self.schema.fields() {
			let value = self.values.get(&field.name).unwrap_or(&null);
			if field.required && value.is_empty() {
				failures.insert(field.name.clone(), "a value is required".to_owned());
				continue;
			}
			if let Some(message) =
				field.validators.iter().find_map(|validator| validator.check(value).err())
			{
				failures.insert(field.name.clone(), message);
			}
		}
		if !self.persisted && self.dn.is_none() {
			let rdn = self.schema.rdn_field()?;
			if self.values.get(&rdn.name).map_or(true, Value::is_empty) {
				failures
					.entry(rdn.name.clone())
					.or_insert_with(|| "a value is required to name the entry".to_owned());
			}
		}
		if failures.is_empty() {
			Ok(())
		} else {
			Err(Error::Validation(failures))
		}
	}

	/// Write the record to the directory: an add for a new record, otherwise
	/// a modify with only the changed attributes. A record without changes
	/// is not sent at all.
	pub async fn save(&mut self, connection: &mut Connection) -> Result<(), Error> {
		self.ensure_usable()?;
		if self.persisted {
			let changes = self.changes()?;
			if changes.is_empty() {
				return Ok(());
			}
			self.validate()?;
			let dn = self.persisted_dn()?.to_owned();
			debug!(dn, changes = changes.len(), "Saving record");
			connection.modify(&dn, changes).await?;
		} else {
			self.validate()?;
			let dn = match &self.dn {
				Some(dn) => dn.clone(),
				None => {
					let rdn = self.schema.rdn_field()?;
					let value = self.values.get(&rdn.name).and_then(Value::as_text).unwrap_or_default();
					self.schema.dn_for(value)?
				}
			};
			let attributes = self.attributes()?;
			debug!(dn, "Creating record");
			connection.add(&dn, attributes).await?;
			self.dn = Some(dn);
			self.persisted = true;
		}
		self.loaded = self.values.clone();
		self.dirty.clear();
		Ok(())
	}

	/// Remove the entry from the directory. The record is unusable afterwards.
	pub async fn delete(&mut self, connection: &mut Connection) -> Result<(), Error> {
		self.ensure_usable()?;
		if self.persisted {
			let dn = self.persisted_dn()?.to_owned();
			connection.delete(&dn).await?;
			debug!(dn, "Deleted record");
		}
		self.deleted = true;
		Ok(())
	}

	/// Every attribute of a new entry, object classes included.
	fn attributes(&self) -> Result<Vec<(String, Vec<String>)>, Error> {
		let mut attributes = Vec::with_capacity(self.schema.fields().len() + 1);
		if !self.schema.object_classes().is_empty() {
			attributes.push(("objectClass".to_owned(), self.schema.object_classes().to_vec()));
		}
		for field in self.schema.fields() {
			let values = encode_field(&self.values, &field.name, field.codec)?;
			if !values.is_empty() {
				attributes.push((field.attribute.clone(), values));
			}
		}
		Ok(attributes)
	}

	/// Fields whose value differs from the synced state.
	fn changed_fields(&self) -> BTreeSet<String> {
		self.values
			.iter()
			.filter(|(name, value)| self.loaded.get(*name) != Some(*value))
			.map(|(name, _)| name.clone())
			.collect()
	}

	/// DN of a stored record.
	fn persisted_dn(&self) -> Result<&str, Error> {
		self.dn.as_deref().ok_or_else(|| Error::Invalid("Stored record without a DN".to_owned()))
	}

	/// Fail once the record is deleted.
	fn ensure_usable(&self) -> Result<(), Error> {
		if self.deleted {
			Err(Error::StaleRecord)
		} else {
			Ok(())
		}
	}
}

/// Encode the named value out of `values`.
fn encode_field(
	values: &BTreeMap<String, Value>,
	field: &str,
	codec: Codec,
) -> Result<Vec<String>, Error> {
	values.get(field).map_or_else(|| Ok(Vec::new()), |value| codec.encode(value))
}
