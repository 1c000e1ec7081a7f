//! Home directory provisioning.
//!
//! For every active user row the backend works out the home directory path,
//! and if it does not exist yet, asks the configured filters whether to
//! create it, copies the skeleton tree into place, hands it to the user and
//! runs the home escape. Existing home directories get the maintenance
//! escapes instead.
//!
//! Every hook sees the row's columns as `AGENT_<COLUMN>` variables plus
//! `AGENT_HOMEPATH`. A row that fails is logged and skipped; it never fails
//! the cycle.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    Result,
    config::{ConfigError, VSiteSection},
    db::{Row, RowSource, SiteDb},
    hooks::{FilterHook, run_optional},
    vsite::{UpdateScope, VSiteBackend},
};

pub const USER_COLUMNS: [&str; 13] = [
    "uid",
    "UserName",
    "gid",
    "groupName",
    "homeDirectory",
    "quota",
    "userAccountState",
    "projid",
    "projName",
    "projGroupName",
    "lastActive",
    "created",
    "modified",
];

/// Account state of users that get a home directory.
pub const ACTIVE_STATE: &str = "A";

/// A `homeformat` placeholder and the column it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    User,
    Uid,
    Group,
    Gid,
    HomeDir,
    Project,
    ProjectId,
    ProjectGroup,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "user" => Field::User,
            "uid" => Field::Uid,
            "group" => Field::Group,
            "gid" => Field::Gid,
            "homedir" => Field::HomeDir,
            "project" => Field::Project,
            "projectid" => Field::ProjectId,
            "projectgroup" => Field::ProjectGroup,
            _ => return None,
        })
    }

    fn column(self) -> &'static str {
        match self {
            Field::User => "UserName",
            Field::Uid => "uid",
            Field::Group => "groupName",
            Field::Gid => "gid",
            Field::HomeDir => "homeDirectory",
            Field::Project => "projName",
            Field::ProjectId => "projid",
            Field::ProjectGroup => "projGroupName",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Field(Field),
}

/// A home directory template such as `/home/{project}/{user}`.
///
/// `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeFormat {
    parts: Vec<Part>,
}

impl HomeFormat {
    pub fn parse(template: &str) -> std::result::Result<Self, String> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(format!("unterminated placeholder '{{{name}'")),
                        }
                    }
                    let field =
                        Field::parse(&name).ok_or_else(|| format!("unknown placeholder '{{{name}}}'"))?;
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Field(field));
                }
                '}' => return Err("unmatched '}'".to_string()),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Fill in the template from `row`. NULL columns render empty.
    pub fn render(&self, row: &Row) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Literal(s) => s.as_str(),
                Part::Field(field) => row.get(field.column()).unwrap_or_default(),
            })
            .collect()
    }
}

/// Validated per-VSite settings of the home directory backend.
#[derive(Debug, Clone)]
pub struct HomeDirSettings {
    pub skeleton: PathBuf,
    pub format: Option<HomeFormat>,
    pub project_filter: Option<FilterHook>,
    pub project_escape: Option<FilterHook>,
    pub home_filter: Option<FilterHook>,
    pub home_escape: Option<FilterHook>,
    pub project_maintenance_escape: Option<FilterHook>,
    pub home_maintenance_escape: Option<FilterHook>,
}

impl HomeDirSettings {
    pub fn new(skeleton: impl Into<PathBuf>) -> Self {
        Self {
            skeleton: skeleton.into(),
            format: None,
            project_filter: None,
            project_escape: None,
            home_filter: None,
            home_escape: None,
            project_maintenance_escape: None,
            home_maintenance_escape: None,
        }
    }

    /// Read and check the settings in `vsite`'s configuration section.
    pub fn from_section(vsite: &str, section: &VSiteSection) -> std::result::Result<Self, ConfigError> {
        let key = |name: &str| format!("{vsite}.{name}");

        let skeleton = section
            .get_str("homeskeleton")
            .ok_or_else(|| ConfigError::Missing {
                key: key("homeskeleton"),
            })?;
        if !Path::new(&skeleton).is_dir() {
            return Err(ConfigError::invalid(&key("homeskeleton"), &skeleton, "not a directory"));
        }

        let mut settings = Self::new(skeleton);
        if let Some(template) = section.get_str("homeformat") {
            let format = HomeFormat::parse(&template)
                .map_err(|reason| ConfigError::invalid(&key("homeformat"), &template, reason))?;
            settings.format = Some(format);
        }
        let hook = |name: &str| section.get_str(name).as_deref().map(FilterHook::parse).transpose();
        settings.project_filter = hook("project_filter")?;
        settings.project_escape = hook("project_escape")?;
        settings.home_filter = hook("home_filter")?;
        settings.home_escape = hook("home_escape")?;
        settings.project_maintenance_escape = hook("project_maintenance_escape")?;
        settings.home_maintenance_escape = hook("home_maintenance_escape")?;
        Ok(settings)
    }

    /// Where `user`'s home directory lives.
    pub fn home_path(&self, user: &Row) -> Option<PathBuf> {
        let path = match &self.format {
            Some(format) => format.render(user),
            None => user.get("homeDirectory")?.to_string(),
        };
        (!path.is_empty()).then(|| PathBuf::from(path))
    }
}

/// Creates home directories for active users.
#[derive(Debug)]
pub struct HomeDirBackend {
    settings: HomeDirSettings,
}

impl HomeDirBackend {
    pub fn new(settings: HomeDirSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &HomeDirSettings {
        &self.settings
    }

    async fn provision(&self, user: &Row) {
        let s = &self.settings;
        let name = user.get("UserName").unwrap_or_default();
        let state = user.get("userAccountState").unwrap_or_default();
        if state != ACTIVE_STATE {
            info!(user = name, state, "Skipping inactive account");
            return;
        }
        let Some(home) = s.home_path(user) else {
            warn!(user = name, "No home directory for user");
            return;
        };
        let home_str = home.to_string_lossy().into_owned();
        let vars = || {
            user.iter()
                .chain(std::iter::once(("homepath", Some(home_str.as_str()))))
        };

        if home.is_dir() {
            debug!(user = name, home = %home.display(), "Home directory already exists");
        } else if home.exists() {
            warn!(user = name, home = %home.display(), "Home path exists and is not a directory");
        } else {
            for (hook, operation) in [
                (&s.project_filter, "project_filter"),
                (&s.project_escape, "project_escape"),
                (&s.home_filter, "home_filter"),
            ] {
                if !run_optional(hook.as_ref(), operation, vars()).await.proceeds() {
                    debug!(user = name, operation, "User filtered out");
                    return;
                }
            }

            let Some(owner) = owner(user) else {
                warn!(user = name, uid = user.get("uid"), gid = user.get("gid"), "Invalid uid or gid");
                return;
            };
            if let Err(e) = copy_tree(&s.skeleton, &home, owner) {
                warn!(user = name, home = %home.display(), "Failed creating home directory: {e}");
                return;
            }
            info!(user = name, home = %home.display(), "Created home directory");

            if !run_optional(s.home_escape.as_ref(), "home_escape", vars())
                .await
                .proceeds()
            {
                debug!(user = name, "Home escape failed");
                return;
            }
        }

        if home.is_dir() {
            run_optional(
                s.project_maintenance_escape.as_ref(),
                "project_maintenance_escape",
                vars(),
            )
            .await;
            run_optional(s.home_maintenance_escape.as_ref(), "home_maintenance_escape", vars()).await;
        }
    }
}

#[async_trait]
impl VSiteBackend for HomeDirBackend {
    async fn update_groups(&mut self, _db: &mut dyn SiteDb, _scope: &UpdateScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn update_users(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()> {
        let users = db.fetch_rows(&scope.query(RowSource::Users, &USER_COLUMNS)).await?;
        info!(vsite = scope.vsite, count = users.len(), "Updating users");
        for user in &users {
            self.provision(user).await;
        }
        Ok(())
    }
}

fn owner(user: &Row) -> Option<(u32, u32)> {
    let uid = user.get("uid")?.trim().parse().ok()?;
    let gid = user.get("gid")?.trim().parse().ok()?;
    Some((uid, gid))
}

/// Copy `src` to the new directory `dst`, keeping modes and giving every
/// entry to `owner`.
fn copy_tree(src: &Path, dst: &Path, owner: (u32, u32)) -> io::Result<()> {
    fs::create_dir(dst)?;
    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;
    chown(dst, owner)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to, owner)?;
        } else if file_type.is_symlink() {
            copy_link(&from, &to)?;
            chown(&to, owner)?;
        } else {
            fs::copy(&from, &to)?;
            chown(&to, owner)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_link(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_link(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

#[cfg(unix)]
fn chown(path: &Path, (uid, gid): (u32, u32)) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}

#[cfg(not(unix))]
fn chown(_path: &Path, _owner: (u32, u32)) -> io::Result<()> {
    Ok(())
}
