//! A backend that only reads.

use async_trait::async_trait;
use tracing::info;

use crate::{
    Result,
    db::{RowSource, SiteDb},
    vsite::{UpdateScope, VSiteBackend},
};

pub const GROUP_COLUMNS: [&str; 4] = ["gid", "groupName", "groupState", "modified"];
pub const MEMBER_COLUMNS: [&str; 1] = ["userName"];
pub const USER_COLUMNS: [&str; 7] = [
    "uid",
    "UserName",
    "gid",
    "groupName",
    "homeDirectory",
    "userAccountState",
    "modified",
];

/// Logs every group, membership and user row of a cycle.
///
/// Useful as a dry run against a live database.
#[derive(Debug, Default)]
pub struct NullBackend {
    password_type: Option<String>,
    rows: usize,
}

impl NullBackend {
    /// `password_type` restricts user rows to one password type.
    pub fn new(password_type: Option<String>) -> Self {
        Self {
            password_type,
            rows: 0,
        }
    }

    /// Rows read during the current cycle.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[async_trait]
impl VSiteBackend for NullBackend {
    async fn prepare_update(&mut self, _db: &mut dyn SiteDb, _scope: &UpdateScope<'_>) -> Result<()> {
        self.rows = 0;
        Ok(())
    }

    async fn update_groups(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()> {
        let groups = db.fetch_rows(&scope.query(RowSource::Groups, &GROUP_COLUMNS)).await?;
        for group in &groups {
            let name = group.get("groupName").unwrap_or_default();
            let members = db
                .fetch_rows(
                    &scope
                        .query(RowSource::GroupMembers, &MEMBER_COLUMNS)
                        .filter("groupName", name),
                )
                .await?;
            info!(
                vsite = scope.vsite,
                group = name,
                gid = group.get("gid"),
                state = group.get("groupState"),
                members = members.len(),
                "Group"
            );
            self.rows += 1 + members.len();
        }
        Ok(())
    }

    async fn update_users(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()> {
        let mut query = scope.query(RowSource::Users, &USER_COLUMNS);
        if let Some(password_type) = &self.password_type {
            query = query.filter("passwordType", password_type.as_str());
        }
        let users = db.fetch_rows(&query).await?;
        for user in &users {
            info!(
                vsite = scope.vsite,
                user = user.get("UserName"),
                uid = user.get("uid"),
                state = user.get("userAccountState"),
                modified = user.get("modified"),
                "User"
            );
        }
        self.rows += users.len();
        Ok(())
    }

    async fn finish_update(
        &mut self,
        _db: &mut dyn SiteDb,
        scope: &UpdateScope<'_>,
        completed: bool,
    ) -> Result<()> {
        info!(vsite = scope.vsite, rows = self.rows, completed, "Dry run finished");
        Ok(())
    }
}
