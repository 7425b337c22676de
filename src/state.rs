use crate::database::DB;
use crate::events::EventBus;
use crate::service::TunnelService;
use crate::settings::SettingsManager;
use crate::store::RuleStore;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// Process-wide handles shared by the daemon and any UI bridge.
pub struct AppState {
    pub db: DB,
    pub tunnel_service: Arc<TunnelService>,
    pub settings: SettingsManager,
    pub events: EventBus,
}

impl AppState {
    pub async fn init(app_data_dir: &Path) -> Result<Self> {
        let db = DB::open(app_data_dir.to_path_buf()).await?;
        let settings = SettingsManager::load(db.clone(), app_data_dir).await?;

        let events = EventBus::default();
        let store = Arc::new(RuleStore::new(Arc::new(db.clone())));
        let tunnel_service = Arc::new(TunnelService::new(
            store,
            Arc::new(events.clone()),
            settings.get_settings(),
        ));

        Ok(Self {
            db,
            tunnel_service,
            settings,
            events,
        })
    }
}
