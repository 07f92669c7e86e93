//! Illustrative extensions: two small, concrete namespaces that
//! exercise the Extension Registry / namespace plug point end to end rather
//! than leaving it purely abstract. Installed into an [`Evaluator`]'s global
//! domain on request; nothing in [`crate::eval`] or [`crate::statement`]
//! depends on either module existing.

pub mod math;
pub mod runtime;

use crate::error::CsError;
use crate::eval::Evaluator;

/// Installs every illustrative extension into `ev`'s global domain.
pub fn install_all(ev: &Evaluator) -> Result<(), CsError> {
    math::install(ev)?;
    runtime::install(ev)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_namespaces_install_without_name_collision() {
        let ev = Evaluator::new();
        install_all(&ev).unwrap();
        assert!(ev.domains.borrow().get_var_global("math").is_ok());
        assert!(ev.domains.borrow().get_var_global("runtime").is_ok());
    }
}
