//! Application root: owns the transport, the single cache store and the
//! query and mutation layers built over it.

use crate::mutations::{self, RecordEdit};
use crate::queries;
use crate::resources::Resource;
use labsite_cache::{
    CacheStore, Draft, Mutation, MutationExecutor, QueryClient, QueryDescriptor, QueryObserver,
    RetryPolicy,
};
use labsite_client::{HttpUploader, SessionToken, Transport};
use labsite_core::{
    decode_record, decode_records, ordered_project_categories, GalleryImage, LabConfig,
    LabResult, NewsItem, PageMeta, Project, ProjectStatus, Publication, TeamMember,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Page whose meta text stores the project category ordering.
const PROJECTS_PAGE: &str = "projects";

/// Handle to the lab backend and its cache. Clones share everything.
#[derive(Clone)]
pub struct LabClient {
    config: Arc<LabConfig>,
    transport: Transport,
    session: Arc<SessionToken>,
    queries: QueryClient,
    mutations: MutationExecutor,
}

impl fmt::Debug for LabClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabClient")
            .field("base_url", &self.transport.base_url())
            .field("logged_in", &self.session.is_logged_in())
            .field("store", self.queries.store())
            .finish()
    }
}

impl LabClient {
    /// Build the client from a validated config. A configured token starts
    /// the session logged in.
    pub fn new(config: LabConfig) -> LabResult<Self> {
        config.validate()?;

        let session = Arc::new(SessionToken::new());
        if let Some(token) = config.api.token.as_deref().filter(|t| !t.trim().is_empty()) {
            session.login(token);
        }
        let transport = Transport::new(&config.api)?.with_token_provider(session.clone());

        let store = CacheStore::new(config.cache.clone());
        let queries = QueryClient::new(store.clone())
            .with_retry_policy(RetryPolicy::from_settings(&config.retry));
        let uploader = HttpUploader::from_config(transport.clone(), &config.api);
        let mutations = MutationExecutor::new(store).with_uploader(Arc::new(uploader));

        tracing::info!(
            base_url = %transport.base_url(),
            stale_time_ms = config.cache.stale_time_ms,
            max_retries = config.retry.max_retries,
            "lab client ready"
        );

        Ok(Self {
            config: Arc::new(config),
            transport,
            session,
            queries,
            mutations,
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn store(&self) -> &CacheStore {
        self.queries.store()
    }

    pub fn queries(&self) -> &QueryClient {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationExecutor {
        &self.mutations
    }

    // === Session ===

    pub fn login(&self, token: impl Into<String>) {
        self.session.login(token);
        tracing::info!("admin session started");
    }

    pub fn logout(&self) {
        self.session.logout();
        tracing::info!("admin session ended");
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_logged_in()
    }

    // === Reads ===

    pub fn observe(&self, descriptor: QueryDescriptor) -> QueryObserver {
        self.queries.observe(descriptor)
    }

    pub fn observe_projects(&self, status: Option<ProjectStatus>) -> QueryObserver {
        self.observe(queries::projects(&self.transport, status))
    }

    pub fn observe_collection(&self, resource: Resource) -> QueryObserver {
        self.observe(queries::collection(&self.transport, resource))
    }

    pub fn observe_page_meta(&self, page: &str) -> QueryObserver {
        self.observe(queries::page_meta(&self.transport, page))
    }

    async fn read_list<T: DeserializeOwned>(&self, descriptor: QueryDescriptor) -> LabResult<Vec<T>> {
        let payload = self.queries.fetch(&descriptor).await?;
        decode_records(&payload)
    }

    pub async fn projects(&self, status: Option<ProjectStatus>) -> LabResult<Vec<Project>> {
        self.read_list(queries::projects(&self.transport, status)).await
    }

    pub async fn news(&self) -> LabResult<Vec<NewsItem>> {
        self.read_list(queries::collection(&self.transport, Resource::News))
            .await
    }

    pub async fn gallery(&self) -> LabResult<Vec<GalleryImage>> {
        self.read_list(queries::collection(&self.transport, Resource::Gallery))
            .await
    }

    pub async fn publications(&self) -> LabResult<Vec<Publication>> {
        self.read_list(queries::collection(&self.transport, Resource::Publications))
            .await
    }

    pub async fn team(&self) -> LabResult<Vec<TeamMember>> {
        self.read_list(queries::collection(&self.transport, Resource::Team))
            .await
    }

    pub async fn page_meta(&self, page: &str) -> LabResult<PageMeta> {
        let payload = self
            .queries
            .fetch(&queries::page_meta(&self.transport, page))
            .await?;
        decode_record(&payload)
    }

    /// Categories of all projects, in the order saved on the projects page.
    pub async fn project_categories(&self) -> LabResult<Vec<String>> {
        let projects = self.projects(None).await?;
        let meta = self.page_meta(PROJECTS_PAGE).await?;
        Ok(ordered_project_categories(&projects, Some(&meta)))
    }

    /// GET any path through the cache.
    pub async fn get(&self, path: &str) -> LabResult<Arc<Value>> {
        self.queries.fetch(&queries::raw(&self.transport, path)).await
    }

    // === Writes ===

    pub fn create(&self, resource: Resource) -> Mutation<Draft> {
        self.mutations
            .mutation(mutations::create(&self.transport, resource))
    }

    pub fn update(&self, resource: Resource) -> Mutation<RecordEdit> {
        self.mutations
            .mutation(mutations::update(&self.transport, resource))
    }

    pub fn delete(&self, resource: Resource) -> Mutation<String> {
        self.mutations
            .mutation(mutations::delete(&self.transport, resource))
    }

    pub fn update_meta(&self, page: &str) -> Mutation<Value> {
        self.mutations
            .mutation(mutations::update_meta(&self.transport, page))
    }

    /// Save a new category ordering on the projects page.
    pub async fn save_category_order(&self, order: &[String]) -> LabResult<Value> {
        self.update_meta(PROJECTS_PAGE)
            .mutate_async(serde_json::json!({ "categoryOrder": order }))
            .await
    }
}
