pub mod entity;
pub mod models;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use entity::prelude::*;
use entity::{app_settings, rule};
use log::{debug, info};
use models::{
    AppSettings as AppSettingsModel, AuthType, ForwardSpec, ReverseSpec, Rule, RuleSpec,
    RuleStatus,
};
use sea_orm::{
    sea_query::OnConflict, ConnectOptions, Database, DatabaseConnection, EntityTrait, QueryOrder,
    Set, TransactionTrait,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::RuleBackend;

/// SQLite-backed persistence for rules and settings.
#[derive(Clone, Debug)]
pub struct DB {
    connection: DatabaseConnection,
}

impl DB {
    pub async fn open(app_data_dir: PathBuf) -> Result<Self> {
        if !app_data_dir.exists() {
            std::fs::create_dir_all(&app_data_dir)
                .context("Failed to create app data directory")?;
        }

        let db_path = app_data_dir.join("sqlite.db");

        if !db_path.exists() {
            info!("Creating database file at: {}", db_path.display());
            std::fs::File::create(&db_path).context("Failed to create database file")?;
        }

        // Schema first, so the ORM pool never sees a half-migrated file.
        run_migrations(&db_path).await?;

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        info!("Opening SQLite database at: {}", db_url);

        let mut opt = ConnectOptions::new(&db_url);
        opt.max_connections(4)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(10))
            .sqlx_logging(false);

        let connection = Database::connect(opt)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { connection })
    }

    pub async fn close(self) -> Result<()> {
        self.connection
            .close()
            .await
            .context("Failed to close database")
    }

    pub async fn load_settings(&self) -> Result<Option<AppSettingsModel>> {
        debug!("Loading application settings");

        let settings = AppSettings::find_by_id(1)
            .one(&self.connection)
            .await
            .context("Failed to query app settings")?;

        Ok(settings.map(|s| AppSettingsModel {
            connect_timeout_secs: non_negative(s.connect_timeout_secs),
            ssh_timeout_secs: non_negative(s.ssh_timeout_secs),
            keep_alive_interval: non_negative(s.keep_alive_interval),
            keep_alive_max: non_negative(s.keep_alive_max),
            shutdown_grace_secs: non_negative(s.shutdown_grace_secs),
            forward_bind_host: s.forward_bind_host,
            replay_on_startup: s.replay_on_startup,
        }))
    }

    pub async fn save_settings(&self, settings: &AppSettingsModel) -> Result<()> {
        debug!("Saving application settings (Upsert)");

        let active_model = app_settings::ActiveModel {
            id: Set(1),
            connect_timeout_secs: Set(clamp_i32(settings.connect_timeout_secs)),
            ssh_timeout_secs: Set(clamp_i32(settings.ssh_timeout_secs)),
            keep_alive_interval: Set(clamp_i32(settings.keep_alive_interval)),
            keep_alive_max: Set(clamp_i32(settings.keep_alive_max)),
            shutdown_grace_secs: Set(clamp_i32(settings.shutdown_grace_secs)),
            forward_bind_host: Set(settings.forward_bind_host.clone()),
            replay_on_startup: Set(settings.replay_on_startup),
        };

        AppSettings::insert(active_model)
            .on_conflict(
                OnConflict::column(app_settings::Column::Id)
                    .update_columns([
                        app_settings::Column::ConnectTimeoutSecs,
                        app_settings::Column::SshTimeoutSecs,
                        app_settings::Column::KeepAliveInterval,
                        app_settings::Column::KeepAliveMax,
                        app_settings::Column::ShutdownGraceSecs,
                        app_settings::Column::ForwardBindHost,
                        app_settings::Column::ReplayOnStartup,
                    ])
                    .to_owned(),
            )
            .exec(&self.connection)
            .await
            .context("Failed to upsert settings")?;

        Ok(())
    }

    pub async fn load_rules(&self) -> Result<Vec<Rule>> {
        debug!("Loading rules");

        let entities = Rules::find()
            .order_by_asc(rule::Column::Position)
            .all(&self.connection)
            .await
            .context("Failed to load rules")?;

        entities.into_iter().map(Rule::try_from).collect()
    }

    /// Rewrites the whole rule table in one transaction.
    pub async fn save_rules(&self, rules: &[Rule]) -> Result<()> {
        debug!("Saving {} rules", rules.len());

        let models = rules
            .iter()
            .enumerate()
            .map(|(position, rule)| to_active_model(position, rule))
            .collect::<Result<Vec<_>>>()?;

        let txn = self
            .connection
            .begin()
            .await
            .context("Failed to begin rules transaction")?;

        Rules::delete_many()
            .exec(&txn)
            .await
            .context("Failed to clear rules")?;

        if !models.is_empty() {
            Rules::insert_many(models)
                .exec(&txn)
                .await
                .context("Failed to insert rules")?;
        }

        txn.commit().await.context("Failed to commit rules")?;

        Ok(())
    }
}

#[async_trait]
impl RuleBackend for DB {
    async fn load(&self) -> Result<Vec<Rule>> {
        self.load_rules().await
    }

    async fn save(&self, rules: &[Rule]) -> Result<()> {
        self.save_rules(rules).await
    }
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn port(value: i32, column: &str, id: &str) -> Result<u16> {
    u16::try_from(value).with_context(|| format!("Invalid {column} {value} for rule {id}"))
}

fn required(value: Option<String>, column: &str, id: &str) -> Result<String> {
    value.ok_or_else(|| anyhow!("Missing {column} for rule {id}"))
}

impl TryFrom<rule::Model> for Rule {
    type Error = anyhow::Error;

    fn try_from(row: rule::Model) -> Result<Self> {
        let id = row.id;
        let spec = match row.kind.as_str() {
            "forward" => RuleSpec::Forward(ForwardSpec {
                remote_host: required(row.remote_host, "remote_host", &id)?,
                remote_port: port(row.remote_port, "remote_port", &id)?,
                local_port: port(row.local_port, "local_port", &id)?,
            }),
            "reverse-ssh" => {
                let auth_type = row.auth_type.unwrap_or_default();
                RuleSpec::ReverseSsh(ReverseSpec {
                    ssh_host: required(row.ssh_host, "ssh_host", &id)?,
                    ssh_port: port(row.ssh_port.unwrap_or(22), "ssh_port", &id)?,
                    ssh_user: required(row.ssh_user, "ssh_user", &id)?,
                    auth_type: AuthType::parse(&auth_type)
                        .ok_or_else(|| anyhow!("Invalid auth type {auth_type} for rule {id}"))?,
                    password: row.password,
                    private_key_path: row.private_key_path,
                    remote_bind_host: row
                        .remote_bind_host
                        .unwrap_or_else(|| models::DEFAULT_REMOTE_BIND_HOST.to_string()),
                    remote_port: port(row.remote_port, "remote_port", &id)?,
                    local_port: port(row.local_port, "local_port", &id)?,
                })
            }
            other => bail!("Invalid rule kind {other} for rule {id}"),
        };

        let status = RuleStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("Invalid status {} for rule {id}", row.status))?;

        Ok(Rule {
            id,
            spec,
            status,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

fn to_active_model(position: usize, rule: &Rule) -> Result<rule::ActiveModel> {
    let position = i32::try_from(position).context("Too many rules")?;
    let mut model = rule::ActiveModel {
        id: Set(rule.id.clone()),
        position: Set(position),
        kind: Set(rule.spec.kind().to_string()),
        remote_host: Set(None),
        ssh_host: Set(None),
        ssh_port: Set(None),
        ssh_user: Set(None),
        auth_type: Set(None),
        password: Set(None),
        private_key_path: Set(None),
        remote_bind_host: Set(None),
        remote_port: Set(0),
        local_port: Set(0),
        status: Set(rule.status.as_str().to_string()),
        error: Set(rule.error.clone()),
        created_at: Set(rule.created_at),
    };

    match &rule.spec {
        RuleSpec::Forward(spec) => {
            model.remote_host = Set(Some(spec.remote_host.clone()));
            model.remote_port = Set(i32::from(spec.remote_port));
            model.local_port = Set(i32::from(spec.local_port));
        }
        RuleSpec::ReverseSsh(spec) => {
            model.ssh_host = Set(Some(spec.ssh_host.clone()));
            model.ssh_port = Set(Some(i32::from(spec.ssh_port)));
            model.ssh_user = Set(Some(spec.ssh_user.clone()));
            model.auth_type = Set(Some(spec.auth_type.as_str().to_string()));
            model.password = Set(spec.password.clone());
            model.private_key_path = Set(spec.private_key_path.clone());
            model.remote_bind_host = Set(Some(spec.remote_bind_host.clone()));
            model.remote_port = Set(i32::from(spec.remote_port));
            model.local_port = Set(i32::from(spec.local_port));
        }
    }

    Ok(model)
}

async fn run_migrations(db_path: &Path) -> Result<()> {
    info!("Running database migrations");

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .context("Failed to connect for migrations")?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("Migration failed")?;

    pool.close().await;

    info!("Database migrations complete");
    Ok(())
}
