use serde_json::{Map, Value};

/// Slices a rendered list into numbered pages.
///
/// With only `pages`, the page size is `len / pages + 1`. With only
/// `items_per_page`, every page that has items is returned. With both, at most
/// `pages` pages of `items_per_page` items. Without either the list is
/// returned unchanged.
pub fn paginate(items: Vec<Value>, pages: Option<usize>, items_per_page: Option<usize>) -> Value {
    let pages = pages.filter(|p| *p > 0);
    let items_per_page = items_per_page.filter(|n| *n > 0);
    if items.is_empty() {
        return Value::Array(items);
    }

    let (size, limit) = match (pages, items_per_page) {
        (None, None) => return Value::Array(items),
        (Some(pages), None) => (items.len() / pages + 1, None),
        (None, Some(per_page)) => (per_page, None),
        (Some(pages), Some(per_page)) => (per_page, Some(pages)),
    };

    let mut out = Map::new();
    for (index, chunk) in items.chunks(size).enumerate() {
        if limit.is_some_and(|l| index >= l) {
            break;
        }
        out.insert((index + 1).to_string(), Value::Array(chunk.to_vec()));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(n: i64) -> Vec<Value> {
        (1..=n).map(|i| json!(i)).collect()
    }

    #[test]
    fn test_no_parameters_returns_list() {
        assert_eq!(paginate(items(3), None, None), json!([1, 2, 3]));
        assert_eq!(paginate(items(3), Some(0), Some(0)), json!([1, 2, 3]));
        assert_eq!(paginate(vec![], Some(2), None), json!([]));
    }

    #[test]
    fn test_pages_only_derives_page_size() {
        // 5 / 2 + 1 = 3 items per page
        assert_eq!(
            paginate(items(5), Some(2), None),
            json!({"1": [1, 2, 3], "2": [4, 5]})
        );
    }

    #[test]
    fn test_items_per_page_only() {
        assert_eq!(
            paginate(items(5), None, Some(2)),
            json!({"1": [1, 2], "2": [3, 4], "3": [5]})
        );
    }

    #[test]
    fn test_both_parameters_stop_at_existing_pages() {
        assert_eq!(paginate(items(5), Some(2), Some(2)), json!({"1": [1, 2], "2": [3, 4]}));
        assert_eq!(paginate(items(3), Some(5), Some(2)), json!({"1": [1, 2], "2": [3]}));
    }
}
