use crate::settings::PAGE_SIZE;

/// Rounds `x` up to the next multiple of `a`, or `None` when the result
/// does not fit in a `u64`.
pub fn align_to(x: u64, a: u64) -> Option<u64> {
    x.div_ceil(a).checked_mul(a)
}

/// Rounds a cell count up so the cells fill whole pages.
pub fn align_up_to_page(n_cells: u64, cell_size: u64) -> Option<u64> {
    let cells_per_page = PAGE_SIZE / cell_size;
    align_to(n_cells, cells_per_page)
}
