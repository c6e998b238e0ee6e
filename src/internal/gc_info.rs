use crate::gc_info_table::{ClassInfo, CLASS_TABLE};

use super::trace_trait::Trace;

/// Gives access to the process-lifetime [`ClassInfo`] of a traceable type.
pub trait ClassInfoTrait: Trace + Sized + 'static {
    fn class_info() -> &'static ClassInfo;
}

impl<T: Trace + Sized + 'static> ClassInfoTrait for T {
    fn class_info() -> &'static ClassInfo {
        CLASS_TABLE.class_info_of::<T>()
    }
}
