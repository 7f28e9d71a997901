//! Admin-defined ordering of project categories.

/// Reorder `categories` by a saved ordering.
///
/// Items named in `saved_order` come first, in `saved_order`'s relative
/// order; everything else follows in its original relative order. The
/// output always holds exactly the items of `categories` (duplicates
/// included). Saved names that do not occur in `categories` are ignored,
/// and repeated saved names only count once.
pub fn apply_category_order<T>(categories: &[T], saved_order: Option<&[T]>) -> Vec<T>
where
    T: PartialEq + Clone,
{
    let saved_order = match saved_order {
        Some(order) if !order.is_empty() => order,
        _ => return categories.to_vec(),
    };

    let mut taken = vec![false; categories.len()];
    let mut ordered = Vec::with_capacity(categories.len());

    for (i, wanted) in saved_order.iter().enumerate() {
        if saved_order[..i].contains(wanted) {
            continue;
        }
        for (j, item) in categories.iter().enumerate() {
            if !taken[j] && item == wanted {
                taken[j] = true;
                ordered.push(item.clone());
            }
        }
    }

    ordered.extend(
        categories
            .iter()
            .zip(taken.iter())
            .filter(|(_, taken)| !**taken)
            .map(|(item, _)| item.clone()),
    );
    ordered
}

/// Distinct values in first-appearance order.
pub fn distinct_in_order<T, I>(items: I) -> Vec<T>
where
    T: PartialEq,
    I: IntoIterator<Item = T>,
{
    let mut out: Vec<T> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
