//! Mapping of directory entries onto typed records.
//!
//! A [`Schema`] declares how the attributes of one kind of entry map onto
//! named fields. Records loaded through it track which fields change, so
//! saving sends only the attributes that actually differ.
//!
//! ```no_run
//! # async fn run(conn: &mut ldap_pool::Connection) -> Result<(), ldap_pool::Error> {
//! use ldap_pool::{Codec, Field, Filter, Mapper, Schema};
//!
//! let mut mapper = Mapper::new();
//! mapper.register(
//! 	Schema::builder("person", "ou=people,dc=example,dc=org")
//! 		.object_class("inetOrgPerson")
//! 		.field(Field::new("username", "uid", Codec::Text).required())
//! 		.field(Field::new("name", "cn", Codec::Text).required())
//! 		.rdn("username")
//! 		.build()?,
//! );
//!
//! let query = mapper.query("person")?.filter(Filter::eq("username", "jdoe"))?;
//! if let Some(mut person) = query.one(conn).await? {
//! 	person.set("name", "Jane Doe")?;
//! 	person.save(conn).await?;
//! }
//! # Ok(())
//! # }
//! ```
use std::{collections::HashMap, sync::Arc, time::Duration};

pub mod record;
pub mod schema;

pub use self::{
	record::{Record, RecordState},
	schema::{escape_dn_value, Codec, Field, Schema, SchemaBuilder, Validator, Value},
};
use crate::{
	connection::Connection,
	entry::Entry,
	error::Error,
	filter::{self, Filter},
	pool::Pool,
	protocol::{OrderBy, Scope},
	query::{Cursor, Query},
};

/// Registry of record types by name.
#[derive(Debug, Clone, Default)]
pub struct Mapper {
	/// Registered schemas
	schemas: HashMap<String, Arc<Schema>>,
}

impl Mapper {
	/// An empty registry.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a schema under its name, replacing any previous one.
	pub fn register(&mut self, schema: Schema) -> Arc<Schema> {
		let schema = Arc::new(schema);
		self.schemas.insert(schema.name().to_owned(), Arc::clone(&schema));
		schema
	}

	/// The schema registered as `name`.
	pub fn schema(&self, name: &str) -> Result<Arc<Schema>, Error> {
		self.schemas.get(name).cloned().ok_or_else(|| Error::UnknownSchema(name.to_owned()))
	}

	/// Project an entry as a record of type `name`.
	pub fn load(&self, name: &str, entry: Entry) -> Result<Record, Error> {
		Record::load(self.schema(name)?, entry)
	}

	/// A new, unsaved record of type `name`.
	pub fn create(&self, name: &str) -> Result<Record, Error> {
		Ok(Record::new(self.schema(name)?))
	}

	/// A query over every record of type `name`, one level below the
	/// schema's base DN.
	pub fn query(&self, name: &str) -> Result<MappedQuery, Error> {
		Ok(MappedQuery::new(self.schema(name)?))
	}
}

/// A [`Query`] written against field names that yields [`Record`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedQuery {
	/// Record type
	schema: Arc<Schema>,
	/// The attribute-level query
	query: Query,
}

impl MappedQuery {
	/// Every record of the schema's type.
	#[must_use]
	pub fn new(schema: Arc<Schema>) -> Self {
		let mut query = Query::new(schema.base_dn()).scope(Scope::OneLevel);
		if let Some(type_filter) = schema.type_filter() {
			query = query.filter(type_filter);
		}
		if !schema.captures_extra() {
			query = query.with_attributes(schema.fields().iter().map(|field| field.attribute.clone()));
		}
		Self { schema, query }
	}

	/// AND a clause over field names onto the filter. Fails with
	/// [`Error::UnknownField`] if the clause names an undeclared field.
	pub fn filter(&self, clause: Filter) -> Result<Self, Error> {
		let clause = self.translate(&clause)?;
		Ok(Self { query: self.query.filter(clause), ..self.clone() })
	}

	/// AND the negation of a clause over field names onto the filter.
	pub fn exclude(&self, clause: Filter) -> Result<Self, Error> {
		self.filter(filter::not(clause))
	}

	/// Change the search scope.
	#[must_use]
	pub fn scope(&self, scope: Scope) -> Self {
		Self { query: self.query.scope(scope), ..self.clone() }
	}

	/// Yield at most `limit` records.
	#[must_use]
	pub fn limit(&self, limit: usize) -> Self {
		Self { query: self.query.limit(limit), ..self.clone() }
	}

	/// Change the number of entries fetched per page.
	#[must_use]
	pub fn page_size(&self, page_size: u32) -> Self {
		Self { query: self.query.page_size(page_size), ..self.clone() }
	}

	/// Ask the server to order results by a field.
	pub fn order_by(&self, field: &str, descending: bool) -> Result<Self, Error> {
		let attribute = self.schema.attribute_of(field)?.to_owned();
		let order = OrderBy { attribute, descending };
		Ok(Self { query: self.query.order_by(order), ..self.clone() })
	}

	/// The attribute-level query that will be sent.
	#[must_use]
	pub fn query(&self) -> &Query {
		&self.query
	}

	/// Prepare to run over `connection`. Nothing is sent until the cursor is
	/// first advanced.
	pub fn execute<'c>(&self, connection: &'c mut Connection) -> Result<RecordCursor<'c>, Error> {
		Ok(RecordCursor { schema: Arc::clone(&self.schema), cursor: self.query.execute(connection)? })
	}

	/// Prepare to run over a pooled connection.
	pub fn execute_pooled(
		&self,
		pool: &Pool,
		timeout: Duration,
	) -> Result<RecordCursor<'static>, Error> {
		Ok(RecordCursor {
			schema: Arc::clone(&self.schema),
			cursor: self.query.execute_pooled(pool, timeout)?,
		})
	}

	/// The first matching record, if any.
	pub async fn one(&self, connection: &mut Connection) -> Result<Option<Record>, Error> {
		self.query
			.one(connection)
			.await?
			.map(|entry| Record::load(Arc::clone(&self.schema), entry))
			.transpose()
	}

	/// Every matching record.
	pub async fn all(&self, connection: &mut Connection) -> Result<Vec<Record>, Error> {
		self.execute(connection)?.collect().await
	}

	/// Number of matching records.
	pub async fn count(&self, connection: &mut Connection) -> Result<usize, Error> {
		self.query.count(connection).await
	}

	/// Rename field names in `clause` to attribute names.
	fn translate(&self, clause: &Filter) -> Result<Filter, Error> {
		clause.map_attributes(&mut |field: &str| self.schema.attribute_of(field).map(str::to_owned))
	}
}

/// A forward-only sequence of records.
#[derive(Debug)]
pub struct RecordCursor<'c> {
	/// Record type
	schema: Arc<Schema>,
	/// Underlying entries
	cursor: Cursor<'c>,
}

impl RecordCursor<'_> {
	/// The next record. `Ok(None)` marks the end.
	pub async fn next(&mut self) -> Result<Option<Record>, Error> {
		match self.cursor.next().await? {
			Some(entry) => Record::load(Arc::clone(&self.schema), entry).map(Some),
			None => Ok(None),
		}
	}

	/// Drain the remaining records.
	pub async fn collect(mut self) -> Result<Vec<Record>, Error> {
		let mut records = Vec::new();
		while let Some(record) = self.next().await? {
			records.push(record);
		}
		Ok(records)
	}

	/// Stop early, releasing any open paged search.
	pub async fn finish(self) {
		self.cursor.finish().await;
	}
}
