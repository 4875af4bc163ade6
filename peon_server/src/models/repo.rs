//! peon.repo — a source repository known to the status store.

use diesel::prelude::*;
use serde::Serialize;

use crate::schema::repos;

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize)]
#[diesel(table_name = repos)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = repos)]
pub struct NewRepo<'a> {
    pub name: &'a str,
    pub url: &'a str,
}
