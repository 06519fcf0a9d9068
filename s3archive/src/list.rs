//! Enumerating every object under a prefix, across as many listing pages as it takes
use crate::objstore::ObjectStorage;
use crate::Result;
use snafu::OptionExt;
use tracing::{debug, instrument};

/// List the keys of all objects in `bucket` starting with `prefix`, in listing order.
///
/// Pages are requested one after another, each with the continuation token of the one before,
/// until a page reports it is the last.  If any page request fails, or a truncated page comes
/// without a continuation token, the whole listing fails.
#[instrument(skip(storage))]
pub(crate) async fn list_all_objects(
    storage: &dyn ObjectStorage,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut continuation_token = None;
    let mut pages = 0usize;

    loop {
        let page = storage
            .list_objects_page(bucket, prefix, continuation_token.take())
            .await?;
        pages += 1;
        keys.extend(page.keys);

        if !page.is_truncated {
            break;
        }

        // Without a token the rest of the listing can't be requested
        continuation_token = Some(page.next_continuation_token.with_context(|| {
            crate::error::ListingFailedSnafu {
                bucket,
                prefix,
                reason: format!("page {pages} is truncated but has no continuation token"),
            }
        })?);
    }

    debug!(pages, keys = keys.len(), "Listed all objects under prefix");

    Ok(keys)
}
