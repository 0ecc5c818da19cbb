use cpaor_adapters::{AdapterContext, AdapterError, PageQuery, PagedSource};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPages<R> {
    pub rows: Vec<R>,
    pub requests: u32,
}

/// Reads pages 1, 2, 3, ... until the first empty page. Errors are not caught
/// here; they abort the caller's unit of work.
pub async fn fetch_all_pages<S>(
    source: &S,
    ctx: &AdapterContext,
    query: &PageQuery,
) -> Result<FetchedPages<S::Row>, AdapterError>
where
    S: PagedSource + ?Sized,
{
    let mut rows = Vec::new();
    let mut page = 1u32;
    loop {
        if page % 10 == 0 {
            info!(
                source = source.source_id(),
                country = %query.country,
                page,
                "still paging"
            );
        }
        let batch = source.fetch_page(ctx, query, page).await?;
        if batch.is_empty() {
            break;
        }
        rows.extend(batch);
        page += 1;
    }
    Ok(FetchedPages {
        rows,
        requests: page,
    })
}
