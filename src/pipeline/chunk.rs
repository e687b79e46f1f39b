//! Order-preserving partition into bounded batches.

/// Split `items` into consecutive batches of at most `chunk_size`.
///
/// Concatenating the batches gives back `items` in the same order. The
/// last batch holds the remainder and is not padded. A `chunk_size` of 0
/// is treated as 1.
pub fn chunk<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(chunk_size.max(1))
        .map(<[T]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_three_by_ten() {
        let items: Vec<usize> = (0..23).collect();
        let batches = chunk(&items, 10);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(batches.concat(), items);
    }

    #[test]
    fn empty_input_gives_no_batches() {
        assert!(chunk::<u8>(&[], 10).is_empty());
    }

    #[test]
    fn batch_count_and_order_hold_for_many_sizes() {
        for n in 0..40usize {
            for size in 1..12usize {
                let items: Vec<usize> = (0..n).collect();
                let batches = chunk(&items, size);
                assert_eq!(batches.len(), n.div_ceil(size), "n={n} size={size}");
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
                if let Some((last, full)) = batches.split_last() {
                    assert!(full.iter().all(|b| b.len() == size));
                    assert!(last.len() <= size);
                }
                assert_eq!(batches.concat(), items);
            }
        }
    }

    #[test]
    fn zero_size_behaves_as_one() {
        assert_eq!(chunk(&[1, 2], 0), vec![vec![1], vec![2]]);
    }
}
