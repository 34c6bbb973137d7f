use crate::store::schema::documents;
use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, QueryableByName, Identifiable, Selectable)]
#[diesel(table_name = documents)]
#[diesel(primary_key(path))]
pub struct DocumentRow {
    pub path: String,
    pub collection_path: String,
    pub collection_id: String,
    pub data: String,
    pub updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument<'a> {
    pub path: &'a str,
    pub collection_path: &'a str,
    pub collection_id: &'a str,
    pub data: &'a str,
    pub updated_at: i64,
}
