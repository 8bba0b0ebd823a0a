#![allow(
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::unwrap_used,
	clippy::bool_assert_comparison
)]
use std::{error::Error as StdError, time::Duration};

use ldap_pool::{Count, Error, Filter, Max, Min, OrderBy, Query, Scope, SearchEntryExt};

mod common;

use common::{connect, init_tracing, pool, Directory, Op, PEOPLE};

const WAIT: Duration = Duration::from_secs(5);

fn people() -> Query {
	Query::new(PEOPLE).filter(Filter::eq("objectClass", "person"))
}

fn cookies(searches: &[Op]) -> Vec<Option<Vec<u8>>> {
	searches
		.iter()
		.map(|op| match op {
			Op::Search { cookie, .. } => cookie.clone(),
			other => panic!("not a search: {other:?}"),
		})
		.collect()
}

#[tokio::test]
async fn pages_are_fetched_lazily_and_in_order() -> Result<(), Box<dyn StdError>> {
	init_tracing();
	let directory = Directory::with_people(5);
	let mut conn = connect(&directory).await?;

	let query = people().page_size(2);
	let mut cursor = query.execute(&mut conn)?;
	assert!(directory.searches().is_empty(), "nothing is sent before the first advance");

	let mut uids = Vec::new();
	let mut fetched_after = Vec::new();
	while let Some(entry) = cursor.next().await? {
		uids.push(entry.attr_first("uid").unwrap().to_owned());
		fetched_after.push(directory.searches().len());
	}
	assert_eq!(uids, ["user1", "user2", "user3", "user4", "user5"]);
	assert_eq!(fetched_after, [1, 1, 2, 2, 3]);
	assert_eq!(cursor.pages_fetched(), 3);
	assert!(cursor.is_exhausted());
	assert!(cursor.next().await?.is_none());

	let searches = directory.searches();
	assert_eq!(searches.len(), 3);
	assert_eq!(cookies(&searches), [None, Some(b"2".to_vec()), Some(b"4".to_vec())]);
	for search in &searches {
		assert!(matches!(
			search,
			Op::Search { base, filter, page_size: 2, .. }
				if base == PEOPLE && filter == "(objectClass=person)"
		));
	}
	Ok(())
}

#[tokio::test]
async fn building_queries_sends_nothing() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(3);
	let _conn = connect(&directory).await?;
	directory.clear_ops();

	let query = people()
		.filter(Filter::starts_with("cn", "User"))
		.exclude(Filter::eq("uid", "user2"))
		.with_attributes(["uid"])
		.scope(Scope::Subtree)
		.limit(10)
		.order_by(OrderBy::asc("uid"));
	assert_eq!(
		query.to_request()?.filter,
		"(&(objectClass=person)(cn=User*)(!(uid=user2)))"
	);
	assert!(directory.ops().is_empty());
	Ok(())
}

#[tokio::test]
async fn zero_limit_sends_no_request() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(3);
	let mut conn = connect(&directory).await?;

	let mut cursor = people().limit(0).execute(&mut conn)?;
	assert!(cursor.next().await?.is_none());
	assert!(cursor.is_exhausted());
	assert!(directory.searches().is_empty());
	Ok(())
}

#[tokio::test]
async fn reaching_the_limit_abandons_the_paged_search() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(5);
	let mut conn = connect(&directory).await?;

	let entries = people().page_size(2).limit(3).all(&mut conn).await?;
	assert_eq!(entries.len(), 3);

	let searches = directory.searches();
	assert_eq!(cookies(&searches), [None, Some(b"2".to_vec()), Some(b"4".to_vec())]);
	assert!(matches!(searches.last(), Some(Op::Search { page_size: 0, .. })));
	Ok(())
}

#[tokio::test]
async fn limit_on_a_page_boundary() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(4);
	let mut conn = connect(&directory).await?;

	// The limit is hit exactly at the end of the last page, no abandon needed
	let entries = people().page_size(2).limit(4).all(&mut conn).await?;
	assert_eq!(entries.len(), 4);
	assert_eq!(directory.searches().len(), 2);
	Ok(())
}

#[tokio::test]
async fn connection_lost_mid_iteration() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(5);
	let mut conn = connect(&directory).await?;
	directory.fail_search(2);

	let mut cursor = people().page_size(2).execute(&mut conn)?;
	assert!(cursor.next().await?.is_some());
	assert!(cursor.next().await?.is_some());
	assert!(matches!(cursor.next().await, Err(Error::ConnectionLost(_))));
	assert!(cursor.is_exhausted());
	assert!(cursor.next().await?.is_none(), "a failed cursor stays terminal");
	drop(cursor);

	assert!(conn.is_dead());
	assert_eq!(directory.searches().len(), 2, "no retry");
	assert!(matches!(people().all(&mut conn).await, Err(Error::ConnectionLost(_))));
	Ok(())
}

#[tokio::test]
async fn re_executing_issues_a_new_search() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(3);
	let mut conn = connect(&directory).await?;
	let query = people();

	assert_eq!(query.all(&mut conn).await?.len(), 3);
	directory.insert(common::person("user4", "User 4", 4));
	assert_eq!(query.all(&mut conn).await?.len(), 4);
	assert_eq!(directory.searches().len(), 2);
	Ok(())
}

#[tokio::test]
async fn consumption_helpers() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(5);
	let mut conn = connect(&directory).await?;

	let first = people().one(&mut conn).await?.unwrap();
	assert_eq!(first.attr_first("uid"), Some("user1"));
	assert!(people().filter(Filter::eq("uid", "nobody")).one(&mut conn).await?.is_none());
	assert_eq!(people().exclude(Filter::any_of("uid", ["user1", "user3"])).count(&mut conn).await?, 3);

	let projected = people().with_attributes(["cn"]).one(&mut conn).await?.unwrap();
	assert!(projected.attr_first("uid").is_none());
	assert_eq!(projected.attr_first("cn"), Some("User 1"));
	Ok(())
}

#[tokio::test]
async fn aggregations() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(12);
	let mut conn = connect(&directory).await?;

	let count = people().page_size(5).execute(&mut conn)?.aggregate(Count::default()).await?;
	assert_eq!(count.result, 12);
	let max = people().execute(&mut conn)?.aggregate(Max::new("uidNumber")).await?;
	assert_eq!(max.result.as_deref(), Some("12"));
	let min = people().execute(&mut conn)?.aggregate(Min::new("uid")).await?;
	assert_eq!(min.result.as_deref(), Some("user1"));
	Ok(())
}

#[tokio::test]
async fn malformed_filters_fail_at_execute() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(1);
	let mut conn = connect(&directory).await?;

	assert!(matches!(
		people().filter(Filter::raw("(uid=x")).execute(&mut conn),
		Err(Error::FilterSyntax(_))
	));
	assert!(matches!(
		people().filter(Filter::any_of("uid", Vec::<String>::new())).execute(&mut conn),
		Err(Error::FilterSyntax(_))
	));
	assert!(directory.searches().is_empty());
	Ok(())
}

#[tokio::test]
async fn pooled_cursor_holds_its_lease_only_while_reading() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(3);
	let pool = pool(&directory, 1, Duration::from_secs(300));

	let mut cursor = people().page_size(2).execute_pooled(&pool, WAIT)?;
	assert_eq!(pool.status().checked_out, 0);
	assert!(cursor.next().await?.is_some());
	assert_eq!(pool.status().checked_out, 1);
	while cursor.next().await?.is_some() {}
	let status = pool.status();
	assert_eq!((status.checked_out, status.idle), (0, 1));

	// Dropping a cursor mid-way returns the lease too
	let mut cursor = people().page_size(1).execute_pooled(&pool, WAIT)?;
	assert!(cursor.next().await?.is_some());
	drop(cursor);
	assert_eq!(pool.status().checked_out, 0);
	Ok(())
}

#[tokio::test]
async fn connection_search_shorthand() -> Result<(), Box<dyn StdError>> {
	let directory = Directory::with_people(3);
	let mut conn = connect(&directory).await?;

	let entries =
		conn.search(PEOPLE, &Filter::eq("uid", "user2"), Scope::OneLevel, &["uid"], 0)?.collect().await?;
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].dn, "uid=user2,ou=people,dc=example,dc=org");
	assert!(matches!(directory.searches().last(), Some(Op::Search { page_size: 0, cookie: None, .. })));
	Ok(())
}
