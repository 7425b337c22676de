use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rules")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub position: i32,
    pub kind: String, // "forward" | "reverse-ssh"

    // Forward
    pub remote_host: Option<String>,

    // Reverse SSH
    pub ssh_host: Option<String>,
    pub ssh_port: Option<i32>,
    pub ssh_user: Option<String>,
    pub auth_type: Option<String>, // "password" | "key"
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub remote_bind_host: Option<String>,

    // Shared
    pub remote_port: i32,
    pub local_port: i32,

    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
