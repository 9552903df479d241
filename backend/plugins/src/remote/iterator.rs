use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tether_core::protocol::{PluginCall, RowsList, WireColumn, WireKeyColumn};
use tether_core::{
    Column, CompareOperation, ErrorKind, HostError, HostResult, KeyColumn, QueryContextInfo,
    RowsIterator, Value,
};

use super::{Disposal, RemoteLink};

/// Rows fetched per `RowsSet_GetRows` when the query context gives no hint.
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Default)]
struct IteratorState {
    cache: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
    exhausted: bool,
    key_columns: Option<Vec<KeyColumn>>,
    context: Option<QueryContextInfo>,
    context_dirty: bool,
}

impl IteratorState {
    fn forget_rows(&mut self) {
        self.cache.clear();
        self.current = None;
        self.exhausted = false;
        self.key_columns = None;
    }

    fn batch_size(&self) -> usize {
        match &self.context {
            Some(context) if context.preread_count > 0 => context.preread_count,
            _ => DEFAULT_BATCH_SIZE,
        }
    }
}

/// Rows set living in a plugin, read in batches.
pub struct RemoteRowsIterator {
    link: RemoteLink,
    handle: i32,
    columns: Vec<Column>,
    state: Mutex<IteratorState>,
    disposal: Disposal,
}

impl RemoteRowsIterator {
    /// Bind to `handle`, fetching the column list.
    pub async fn connect(link: RemoteLink, handle: i32) -> HostResult<Self> {
        let wire: Vec<WireColumn> = link.call(PluginCall::RowsSetGetColumns { handle }).await?;
        let columns = wire
            .into_iter()
            .map(Column::from_wire)
            .collect::<HostResult<Vec<_>>>()?;
        Ok(Self {
            link,
            handle,
            columns,
            state: Mutex::new(IteratorState::default()),
            disposal: Disposal::default(),
        })
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn dispose(&self) {
        self.disposal.mark();
        self.state().forget_rows();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }

    fn state(&self) -> MutexGuard<'_, IteratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn invoke<R: serde::de::DeserializeOwned>(&self, call: PluginCall) -> HostResult<R> {
        self.link.call_object(&self.disposal, "rows iterator", call).await
    }

    async fn invoke_unit(&self, call: PluginCall) -> HostResult<()> {
        let _: serde_json::Value = self.invoke(call).await?;
        Ok(())
    }

    /// Push a changed query context before the next read.
    async fn flush_context(&self) -> HostResult<()> {
        let pending = {
            let mut state = self.state();
            if !state.context_dirty {
                return Ok(());
            }
            state.context_dirty = false;
            state.context.as_ref().map(QueryContextInfo::to_wire)
        };
        let Some(context) = pending else { return Ok(()) };
        let pushed = self
            .invoke_unit(PluginCall::RowsSetSetContext {
                handle: self.handle,
                context,
            })
            .await;
        if pushed.is_err() {
            self.state().context_dirty = true;
        }
        pushed
    }

    async fn fetch_batch(&self, count: usize) -> HostResult<(Vec<Vec<Value>>, bool)> {
        let list: RowsList = self
            .invoke(PluginCall::RowsSetGetRows {
                handle: self.handle,
                count: i32::try_from(count).unwrap_or(i32::MAX),
            })
            .await?;
        if list.values.is_empty() {
            return Ok((Vec::new(), false));
        }
        let width = self.columns.len();
        if width == 0 || list.values.len() % width != 0 {
            return Err(HostError::Protocol(format!(
                "rows set #{} returned {} values for {width} columns",
                self.handle,
                list.values.len()
            )));
        }
        let mut values = Vec::with_capacity(list.values.len());
        for value in list.values {
            values.push(self.link.materialize(value).await?);
        }
        let rows = values.chunks(width).map(<[Value]>::to_vec).collect();
        Ok((rows, list.has_more))
    }
}

#[async_trait]
impl RowsIterator for RemoteRowsIterator {
    fn columns(&self) -> Vec<Column> {
        self.columns.clone()
    }

    async fn open(&self) -> HostResult<()> {
        self.flush_context().await?;
        self.invoke_unit(PluginCall::RowsSetOpen { handle: self.handle })
            .await
    }

    async fn close(&self) -> HostResult<()> {
        self.state().forget_rows();
        self.invoke_unit(PluginCall::RowsSetClose { handle: self.handle })
            .await
    }

    async fn reset(&self) -> HostResult<()> {
        self.state().forget_rows();
        self.invoke_unit(PluginCall::RowsSetReset { handle: self.handle })
            .await
    }

    async fn read_next(&self) -> HostResult<bool> {
        self.disposal.check("rows iterator")?;
        let batch = {
            let mut state = self.state();
            if let Some(row) = state.cache.pop_front() {
                state.current = Some(row);
                return Ok(true);
            }
            if state.exhausted {
                state.current = None;
                return Ok(false);
            }
            state.batch_size()
        };

        self.flush_context().await?;
        let (rows, has_more) = self.fetch_batch(batch).await?;

        let mut state = self.state();
        state.cache.extend(rows);
        if !has_more {
            state.exhausted = true;
        }
        state.current = state.cache.pop_front();
        Ok(state.current.is_some())
    }

    fn read_value(&self, column_index: usize) -> HostResult<Value> {
        self.disposal.check("rows iterator")?;
        let state = self.state();
        let row = state
            .current
            .as_ref()
            .ok_or_else(|| HostError::data(ErrorKind::NoData, "no current row"))?;
        row.get(column_index).cloned().ok_or_else(|| {
            HostError::data(
                ErrorKind::InvalidColumnIndex,
                format!("column index {column_index} out of range (0..{})", row.len()),
            )
        })
    }

    async fn key_columns(&self) -> HostResult<Vec<KeyColumn>> {
        if let Some(cached) = &self.state().key_columns {
            return Ok(cached.clone());
        }
        let wire: Vec<WireKeyColumn> = self
            .invoke(PluginCall::RowsSetGetKeyColumns { handle: self.handle })
            .await?;
        let columns: Vec<KeyColumn> = wire.into_iter().map(KeyColumn::from_wire).collect();
        self.state().key_columns = Some(columns.clone());
        Ok(columns)
    }

    async fn set_key_column_value(
        &self,
        column: &str,
        operation: CompareOperation,
        value: Value,
    ) -> HostResult<()> {
        self.invoke_unit(PluginCall::RowsSetSetKeyColumnValue {
            handle: self.handle,
            column_name: column.to_string(),
            operation: operation.to_string(),
            value: value.to_wire()?,
        })
        .await
    }

    async fn unset_key_column_value(
        &self,
        column: &str,
        operation: CompareOperation,
    ) -> HostResult<()> {
        self.invoke_unit(PluginCall::RowsSetUnsetKeyColumnValue {
            handle: self.handle,
            column_name: column.to_string(),
            operation: operation.to_string(),
        })
        .await
    }

    async fn update_value(&self, column_index: usize, value: Value) -> HostResult<()> {
        if column_index >= self.columns.len() {
            return Err(HostError::data(
                ErrorKind::InvalidColumnIndex,
                format!("column index {column_index} out of range"),
            ));
        }
        self.invoke_unit(PluginCall::RowsSetUpdateValue {
            handle: self.handle,
            column_index: i32::try_from(column_index).unwrap_or(i32::MAX),
            value: value.to_wire()?,
        })
        .await?;
        if let Some(row) = self.state().current.as_mut() {
            if let Some(slot) = row.get_mut(column_index) {
                *slot = value;
            }
        }
        Ok(())
    }

    async fn delete_row(&self) -> HostResult<()> {
        self.invoke_unit(PluginCall::RowsSetDeleteRow { handle: self.handle })
            .await
    }

    async fn position(&self) -> HostResult<i64> {
        self.invoke(PluginCall::RowsSetPosition { handle: self.handle })
            .await
    }

    async fn total_rows(&self) -> HostResult<Option<i64>> {
        let total: i64 = self
            .invoke(PluginCall::RowsSetTotalRows { handle: self.handle })
            .await?;
        Ok((total >= 0).then_some(total))
    }

    async fn unique_key(&self) -> HostResult<Vec<String>> {
        self.invoke(PluginCall::RowsSetGetUniqueKey { handle: self.handle })
            .await
    }

    fn set_query_context(&self, context: QueryContextInfo) {
        let mut state = self.state();
        state.context = Some(context);
        state.context_dirty = true;
    }

    fn remote_handle(&self) -> Option<i32> {
        Some(self.handle)
    }
}
