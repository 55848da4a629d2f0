use std::collections::HashSet;

use keypoold_storage::Column;

#[test]
fn column_indices_are_dense_and_names_unique() {
    let mut names = HashSet::new();
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        assert!(names.insert(column.as_str()), "duplicate name for {column:?}");
        assert!(column.as_str().starts_with("wallet_"));
    }
}
