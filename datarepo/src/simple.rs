//! The default repository implementation every generated repository delegates to.

use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use datarepo_core::engine::Engine;
use datarepo_core::hints::{BulkOptions, QueryHints};
use datarepo_core::paging::{Page, PageRequest, Slice, Sort};
use datarepo_core::projection::{FromRecord, Projection};
use datarepo_core::ql::{Shape, TextQuery};
use datarepo_core::query::{
    BulkDelete, BulkUpdate, CountQuery, JoinKind, Operand, Params, Path, Predicate, SelectQuery,
};
use datarepo_core::session::Session;
use datarepo_core::specification::Specification;
use datarepo_core::{
    EntityKey, EntityMeta, Fetchable, FromParamValue, Identifiable, Insertable,
    ParamValue, Record, RepoError, RepoResult, Repository, RowAdapter, SpecificationExecutor,
    Updatable,
};

/// CRUD, paging and query execution for one entity type.
///
/// Entity results go through the session's persistence context: a row whose key is
/// already managed is returned with the managed column values, and new rows become
/// managed. Read-only hints skip the context entirely.
pub struct SimpleRepository<T, A> {
    adapter: A,
    meta: EntityMeta,
    _entity: PhantomData<fn() -> T>,
}

impl<T, A: Clone> Clone for SimpleRepository<T, A> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            meta: self.meta,
            _entity: PhantomData,
        }
    }
}

impl<T, A> fmt::Debug for SimpleRepository<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleRepository")
            .field("entity", &self.meta.name)
            .field("table", &self.meta.table)
            .finish()
    }
}

fn log_op(op: &'static str, entity: &'static str, start: Instant, rows: usize) {
    tracing::debug!(
        op,
        entity,
        rows,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "repository op"
    );
}

impl<T, A> SimpleRepository<T, A>
where
    T: Fetchable + Identifiable + Insertable + Updatable + Clone + Send + Sync + 'static,
    T::Key: Clone + Send + Sync + Into<ParamValue> + FromParamValue,
    A: RowAdapter<T, Row = Record> + Clone + Send + Sync + 'static,
{
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            meta: EntityMeta::of::<T>(),
            _entity: PhantomData,
        }
    }

    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// An unrestricted select over this entity, for hand-written queries.
    pub fn query(&self) -> SelectQuery {
        SelectQuery::new(self.meta)
    }

    fn entity_key(&self, key: &ParamValue) -> RepoResult<EntityKey> {
        key.entity_key().ok_or_else(|| {
            RepoError::mapping(datarepo_core::ConversionError {
                expected: "entity key",
                found: format!("{key:?}"),
            })
        })
    }

    fn key_param(&self, id: &T::Key) -> ParamValue {
        id.clone().into()
    }

    fn insert_record(&self, entity: &T, key: ParamValue) -> Record {
        let mut record = Record::new().with(self.meta.id_column, key);
        for (column, value) in T::INSERT_COLUMNS.iter().zip(entity.insert_values()) {
            record.set(*column, value);
        }
        record
    }

    fn update_record(&self, entity: &T) -> Record {
        T::UPDATE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .zip(entity.update_values())
            .collect()
    }

    /// Map rows to entities through the persistence context.
    fn materialize<E: Engine>(
        &self,
        session: &mut Session<E>,
        rows: Vec<Record>,
        hints: &QueryHints,
    ) -> RepoResult<Vec<T>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if hints.read_only {
                out.push(self.adapter.from_row(&row)?);
                continue;
            }
            let key = row
                .get(self.meta.id_column)
                .and_then(ParamValue::entity_key);
            let Some(key) = key else {
                out.push(self.adapter.from_row(&row)?);
                continue;
            };
            if let Some(managed) = session.cached(&self.meta, &key) {
                let mut merged = row.clone();
                merged.merge(managed);
                out.push(self.adapter.from_row(&merged)?);
                continue;
            }
            let entity = self.adapter.from_row(&row)?;
            session.manage(&self.meta, key, row.unscoped());
            out.push(entity);
        }
        Ok(out)
    }

    async fn rows<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: &SelectQuery,
    ) -> RepoResult<Vec<Record>> {
        query.validate()?;
        session.select(query).await
    }

    /// Insert when the entity has no key; otherwise update the stored row, inserting it
    /// under the given key when no row exists.
    pub async fn save<E: Engine>(&self, session: &mut Session<E>, entity: T) -> RepoResult<T> {
        let start = Instant::now();
        let saved = self
            .persist(session, entity)
            .await
            .map_err(|e| e.during("save"))?;
        log_op("save", self.meta.name, start, 1);
        Ok(saved)
    }

    async fn persist<E: Engine>(&self, session: &mut Session<E>, entity: T) -> RepoResult<T> {
        Ok(match entity.id() {
            None => {
                let mut record = self.insert_record(&entity, ParamValue::Null);
                let key = session.insert(&self.meta, &record).await?;
                let id = T::Key::from_param(&key).map_err(RepoError::mapping)?;
                record.set(self.meta.id_column, key.clone());
                session.manage(&self.meta, self.entity_key(&key)?, record);
                entity.with_id(id)
            }
            Some(id) => {
                let key = self.key_param(&id);
                let changed = session
                    .update(&self.meta, &key, &self.update_record(&entity))
                    .await?;
                let record = self.insert_record(&entity, key.clone());
                if changed == 0 {
                    session.insert(&self.meta, &record).await?;
                }
                session.manage(&self.meta, self.entity_key(&key)?, record);
                entity
            }
        })
    }

    /// Served from the persistence context when the key is managed.
    pub async fn find_by_id<E: Engine>(
        &self,
        session: &mut Session<E>,
        id: &T::Key,
    ) -> RepoResult<Option<T>> {
        let key = self.key_param(id);
        if let Some(managed) = session.cached(&self.meta, &self.entity_key(&key)?) {
            return self.adapter.from_row(managed).map(Some);
        }
        let query = self
            .query()
            .filter(Predicate::eq(Path::column(self.meta.id_column), key));
        self.find_one_with(session, query, &QueryHints::default(), "find_by_id")
            .await
    }

    /// Run an entity query.
    pub async fn find_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        hints: &QueryHints,
        op: &'static str,
    ) -> RepoResult<Vec<T>> {
        let start = Instant::now();
        let query = hints.apply(query);
        let rows = self
            .rows(session, &query)
            .await
            .map_err(|e| e.during(op))?;
        let entities = self.materialize(session, rows, hints)?;
        log_op(op, self.meta.name, start, entities.len());
        Ok(entities)
    }

    /// `None` for no row; [`RepoError::NonUniqueResult`] for more than one.
    pub async fn find_one_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        hints: &QueryHints,
        op: &'static str,
    ) -> RepoResult<Option<T>> {
        let query = hints.apply(query);
        let rows = self
            .rows(session, &query)
            .await
            .map_err(|e| e.during(op))?;
        if rows.len() > 1 {
            return Err(RepoError::NonUniqueResult {
                expected: 1,
                actual: rows.len(),
            });
        }
        Ok(self.materialize(session, rows, hints)?.pop())
    }

    /// One page of `query`, sorted by the query's own order followed by the request's.
    /// The total comes from a count query unless the content already implies it.
    pub async fn find_page_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        request: &PageRequest,
        hints: &QueryHints,
        op: &'static str,
    ) -> RepoResult<Page<T>> {
        let request = request.capped(session.config().max_page_size);
        let count = query.to_count();
        let sort = query.sort.clone().and(request.sort().clone());
        let query = query
            .sorted(sort)
            .offset(request.offset())
            .limit(request.size());
        let content = self.find_with(session, query, hints, op).await?;
        let total = match Page::<T>::known_total(content.len(), &request) {
            Some(total) => total,
            None => session.count(&count).await.map_err(|e| e.during(op))?,
        };
        Ok(Page::new(content, &request, total))
    }

    /// Like [`Self::find_page_with`] without a count: one extra row is fetched to tell
    /// whether another slice follows.
    pub async fn find_slice_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        request: &PageRequest,
        hints: &QueryHints,
        op: &'static str,
    ) -> RepoResult<Slice<T>> {
        let request = request.capped(session.config().max_page_size);
        let sort = query.sort.clone().and(request.sort().clone());
        let query = query
            .sorted(sort)
            .offset(request.offset())
            .limit(request.size() + 1);
        let content = self.find_with(session, query, hints, op).await?;
        Ok(Slice::from_lookahead(content, &request))
    }

    pub async fn count_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: &CountQuery,
        op: &'static str,
    ) -> RepoResult<u64> {
        let start = Instant::now();
        query.as_select().validate()?;
        let n = session.count(query).await.map_err(|e| e.during(op))?;
        log_op(op, self.meta.name, start, 1);
        Ok(n)
    }

    pub async fn exists_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: &CountQuery,
        op: &'static str,
    ) -> RepoResult<bool> {
        Ok(self.count_with(session, query, op).await? > 0)
    }

    /// Load the matching entities and queue each for removal. Returns how many were queued.
    pub async fn delete_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        op: &'static str,
    ) -> RepoResult<u64> {
        let victims = self
            .find_with(session, query, &QueryHints::default(), op)
            .await?;
        let mut queued = 0;
        for entity in &victims {
            if let Some(id) = entity.id() {
                let key = self.entity_key(&self.key_param(&id))?;
                session.queue_delete(&self.meta, key);
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Select exactly the columns of projection `P`. Projections are never managed.
    pub async fn project_with<E: Engine, P: Projection>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        op: &'static str,
    ) -> RepoResult<Vec<P>> {
        let columns = P::columns();
        let mut query = query.columns(columns.clone());
        for relation in P::optional_relations() {
            query = query.join(relation, JoinKind::Left);
        }
        // A required nested view only matches rows that have the relation.
        for relation in columns.iter().filter_map(|p| p.relation.clone()) {
            query = query.join(relation, JoinKind::Inner);
        }
        self.records_with(session, query, op).await
    }

    /// Map each result row with `R::from_record`; used for column and constructor queries.
    pub async fn records_with<E: Engine, R: FromRecord>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        op: &'static str,
    ) -> RepoResult<Vec<R>> {
        let start = Instant::now();
        let rows = self
            .rows(session, &query)
            .await
            .map_err(|e| e.during(op))?;
        let out = rows
            .iter()
            .map(R::from_record)
            .collect::<RepoResult<Vec<_>>>()?;
        log_op(op, self.meta.name, start, out.len());
        Ok(out)
    }

    /// The first selected value of each row.
    pub async fn values_with<E: Engine, V: FromParamValue>(
        &self,
        session: &mut Session<E>,
        query: SelectQuery,
        op: &'static str,
    ) -> RepoResult<Vec<V>> {
        let rows = self
            .rows(session, &query)
            .await
            .map_err(|e| e.during(op))?;
        rows.iter().map(|r| r.try_get_at::<V>(0)).collect()
    }

    /// Run a set-based update. Instances already managed by the session keep their old
    /// values unless `options.clear_after` is set or the caller clears the session.
    pub async fn update_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        stmt: &BulkUpdate,
        options: BulkOptions,
        op: &'static str,
    ) -> RepoResult<u64> {
        let start = Instant::now();
        if options.flush_before {
            session.flush().await?;
        }
        let n = session.bulk_update(stmt).await.map_err(|e| e.during(op))?;
        if options.clear_after {
            session.clear();
        }
        log_op(op, self.meta.name, start, n as usize);
        Ok(n)
    }

    /// Run a set-based delete. Managed instances of removed rows stay in the session
    /// until it is cleared.
    pub async fn delete_bulk_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        stmt: &BulkDelete,
        options: BulkOptions,
        op: &'static str,
    ) -> RepoResult<u64> {
        let start = Instant::now();
        if options.flush_before {
            session.flush().await?;
        }
        let n = session.bulk_delete(stmt).await.map_err(|e| e.during(op))?;
        if options.clear_after {
            session.clear();
        }
        log_op(op, self.meta.name, start, n as usize);
        Ok(n)
    }

    /// Bind and run an `update` or `delete` query text.
    pub async fn modify_with<E: Engine>(
        &self,
        session: &mut Session<E>,
        query: &TextQuery,
        params: &Params,
        options: BulkOptions,
        op: &'static str,
    ) -> RepoResult<u64> {
        match query.shape() {
            Shape::Delete => {
                let stmt = query.bind_delete(params)?;
                self.delete_bulk_with(session, &stmt, options, op).await
            }
            _ => {
                let stmt = query.bind_update(params)?;
                self.update_with(session, &stmt, options, op).await
            }
        }
    }

    fn spec_query(&self, spec: &Specification<T>) -> RepoResult<SelectQuery> {
        Ok(self.query().filter_opt(spec.to_predicate()?))
    }
}

#[async_trait::async_trait]
impl<T, A, E> Repository<T, E> for SimpleRepository<T, A>
where
    T: Fetchable + Identifiable + Insertable + Updatable + Clone + Send + Sync + 'static,
    T::Key: Clone + Send + Sync + Into<ParamValue> + FromParamValue,
    A: RowAdapter<T, Row = Record> + Clone + Send + Sync + 'static,
    E: Engine,
{
    async fn save(&self, session: &mut Session<E>, entity: T) -> RepoResult<T> {
        SimpleRepository::save(self, session, entity).await
    }

    async fn find_by_id(&self, session: &mut Session<E>, id: &T::Key) -> RepoResult<Option<T>> {
        SimpleRepository::find_by_id(self, session, id).await
    }

    async fn find_all(&self, session: &mut Session<E>) -> RepoResult<Vec<T>> {
        self.find_with(session, self.query(), &QueryHints::default(), "find_all")
            .await
    }

    async fn find_all_sorted(&self, session: &mut Session<E>, sort: &Sort) -> RepoResult<Vec<T>> {
        let query = self.query().sorted(sort.clone());
        self.find_with(session, query, &QueryHints::default(), "find_all_sorted")
            .await
    }

    async fn find_all_by_id(
        &self,
        session: &mut Session<E>,
        ids: &[T::Key],
    ) -> RepoResult<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<ParamValue> = ids.iter().map(|id| self.key_param(id)).collect();
        let query = self.query().filter(Predicate::In {
            path: Path::column(self.meta.id_column),
            values: Operand::Value(ParamValue::List(keys)),
            negated: false,
        });
        self.find_with(session, query, &QueryHints::default(), "find_all_by_id")
            .await
    }

    async fn find_by_field(
        &self,
        session: &mut Session<E>,
        field_name: &str,
        value: ParamValue,
    ) -> RepoResult<Vec<T>> {
        let path = Path::parse(field_name)?;
        self.meta.resolve(&path)?;
        let query = self.query().filter(Predicate::eq(path, value));
        self.find_with(session, query, &QueryHints::default(), "find_by_field")
            .await
    }

    async fn find_page(
        &self,
        session: &mut Session<E>,
        request: &PageRequest,
    ) -> RepoResult<Page<T>> {
        self.find_page_with(
            session,
            self.query(),
            request,
            &QueryHints::default(),
            "find_page",
        )
        .await
    }

    async fn count(&self, session: &mut Session<E>) -> RepoResult<u64> {
        self.count_with(session, &CountQuery::new(self.meta), "count")
            .await
    }

    async fn delete(&self, session: &mut Session<E>, entity: &T) -> RepoResult<()> {
        match entity.id() {
            Some(id) => self.delete_by_id(session, &id).await,
            None => Ok(()),
        }
    }

    async fn delete_by_id(&self, session: &mut Session<E>, id: &T::Key) -> RepoResult<()> {
        let key = self.entity_key(&self.key_param(id))?;
        session.queue_delete(&self.meta, key);
        Ok(())
    }

    async fn delete_all(&self, session: &mut Session<E>) -> RepoResult<()> {
        let ids = self
            .query()
            .columns(vec![Path::column(self.meta.id_column)]);
        let rows = self
            .rows(session, &ids)
            .await
            .map_err(|e| e.during("delete_all"))?;
        for row in rows {
            let key = row.try_get::<ParamValue>(self.meta.id_column)?;
            session.queue_delete(&self.meta, self.entity_key(&key)?);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T, A, E> SpecificationExecutor<T, E> for SimpleRepository<T, A>
where
    T: Fetchable + Identifiable + Insertable + Updatable + Clone + Send + Sync + 'static,
    T::Key: Clone + Send + Sync + Into<ParamValue> + FromParamValue,
    A: RowAdapter<T, Row = Record> + Clone + Send + Sync + 'static,
    E: Engine,
{
    async fn find_all_spec(
        &self,
        session: &mut Session<E>,
        spec: &Specification<T>,
    ) -> RepoResult<Vec<T>> {
        let query = self.spec_query(spec)?;
        self.find_with(session, query, &QueryHints::default(), "find_all_spec")
            .await
    }

    async fn find_one_spec(
        &self,
        session: &mut Session<E>,
        spec: &Specification<T>,
    ) -> RepoResult<Option<T>> {
        let query = self.spec_query(spec)?;
        self.find_one_with(session, query, &QueryHints::default(), "find_one_spec")
            .await
    }

    async fn find_page_spec(
        &self,
        session: &mut Session<E>,
        spec: &Specification<T>,
        request: &PageRequest,
    ) -> RepoResult<Page<T>> {
        let query = self.spec_query(spec)?;
        self.find_page_with(
            session,
            query,
            request,
            &QueryHints::default(),
            "find_page_spec",
        )
        .await
    }

    async fn count_spec(
        &self,
        session: &mut Session<E>,
        spec: &Specification<T>,
    ) -> RepoResult<u64> {
        let query = self.spec_query(spec)?.to_count();
        self.count_with(session, &query, "count_spec").await
    }
}
