use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "app_settings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Integer")]
    pub id: i32,
    pub connect_timeout_secs: i32,
    pub ssh_timeout_secs: i32,
    pub keep_alive_interval: i32,
    pub keep_alive_max: i32,
    pub shutdown_grace_secs: i32,
    pub forward_bind_host: String,
    pub replay_on_startup: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
