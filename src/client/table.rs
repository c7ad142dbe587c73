//! Paged reads of table variables.

use crate::error::{Error, Result, Status};
use crate::table::Table;
use crate::topology::{Node, VarRef};
use crate::transport::Transport;
use crate::wire::{Command, GetRequest, GetResponse, MibAddr, Value, VarEntry};

use super::{Client, unknown_var};

/// Fetches restarted after the table changed under us before giving up.
const TABLE_MAX_RESTARTS: u32 = 5;

impl<T: Transport> Client<T> {
    /// Read every row of a table variable.
    ///
    /// Pages are requested from row 0 onwards until the node reports no
    /// rows remaining. If the table's version changes between pages the
    /// fetch starts over. The stored value is replaced only once a complete,
    /// consistent table has been read.
    pub(super) async fn fetch_table(
        &self,
        node: &mut Node,
        var: VarRef,
        mib_id: u32,
        var_index: u8,
    ) -> Result<()> {
        let target = node.address;
        let page_size = self.inner.config.table_page_size;
        let mut restarts = 0;

        'fetch: loop {
            let mut table = Table::new();
            let mut version = None;
            let mut start: u16 = 0;

            loop {
                let request =
                    GetRequest::table(MibAddr::Id(mib_id), var_index, start, page_size).encode();
                let (body, source) = self
                    .exchange_with(node, Command::GetMibRequest, &request, Command::GetResponse, false)
                    .await?;

                let page = match GetResponse::decode(body, source)? {
                    GetResponse::Table { page, .. } => page,
                    GetResponse::Vars(description) => {
                        let slot = node.var_mut(var).ok_or_else(|| unknown_var(target, var))?;
                        return match description.entries.first() {
                            Some(VarEntry::Error(Status::Disabled)) => {
                                slot.enabled = false;
                                Err(Error::status_from(target, Status::Disabled))
                            }
                            Some(VarEntry::Error(status)) => Err(Error::status_from(target, *status)),
                            Some(VarEntry::Value(value)) => {
                                tracing::debug!(
                                    target: "async_jip::table",
                                    { jip.node = %target, jip.actual = %value.var_type() },
                                    "scalar returned for table variable"
                                );
                                Err(Error::status_from(target, Status::WrongType))
                            }
                            None => Err(Error::MalformedResponse { target }.boxed()),
                        };
                    }
                };

                match version {
                    None => version = Some(page.version),
                    Some(expected) if expected != page.version => {
                        restarts += 1;
                        tracing::debug!(
                            target: "async_jip::table",
                            { jip.node = %target, jip.expected = expected, jip.version = page.version, jip.restarts = restarts },
                            "table changed during fetch"
                        );
                        if restarts > TABLE_MAX_RESTARTS {
                            return Err(Error::status_from(target, Status::Failed));
                        }
                        continue 'fetch;
                    }
                    Some(_) => {}
                }

                for (row, data) in &page.entries {
                    table
                        .update_row(*row, data.clone())
                        .map_err(|status| Error::status_from(target, status))?;
                }

                if page.remaining == 0 {
                    break;
                }
                // More rows promised but none sent: we would ask for the same page forever.
                let Some((last, _)) = page.entries.last() else {
                    return Err(Error::MalformedResponse { target }.boxed());
                };
                start = last.checked_add(1).ok_or_else(|| Error::MalformedResponse { target }.boxed())?;
            }

            tracing::trace!(
                target: "async_jip::table",
                { jip.node = %target, jip.rows = table.present(), jip.restarts = restarts },
                "table fetched"
            );
            let slot = node.var_mut(var).ok_or_else(|| unknown_var(target, var))?;
            slot.enabled = true;
            slot.value = Some(Value::Table(table));
            return Ok(());
        }
    }
}
