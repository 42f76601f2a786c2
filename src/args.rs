//! Typed argument encoding for event records.
//!
//! Each supported argument type contributes one 32-bit slot and a WTF type
//! name used when building argument signatures. The value type is a generic
//! associated type so that event descriptors over string arguments stay
//! `'static` while still accepting borrowed values at the call site.

use crate::string_table::StringTable;

/// A single event argument type: its WTF type name, the value it accepts,
/// and how that value is packed into slots.
pub trait EventArgument {
    /// WTF type name as it appears in an argument signature.
    const TYPE_NAME: &'static str;

    /// Slots consumed by one value of this type.
    const SLOT_COUNT: usize = 1;

    /// The value accepted at an emission site.
    type Value<'a>;

    /// Packs `value` into `slot`, interning strings through `string_table`.
    fn emit(value: Self::Value<'_>, string_table: &StringTable, slot: &mut u32);
}

macro_rules! integral_argument {
    ($ty:ty, $name:expr) => {
        impl EventArgument for $ty {
            const TYPE_NAME: &'static str = $name;
            type Value<'a> = $ty;

            fn emit(value: $ty, _string_table: &StringTable, slot: &mut u32) {
                // Numeric casts sign-extend signed sources and zero-extend
                // unsigned ones; 64-bit sources truncate to the low 32 bits
                // (WTF has no native 64-bit type).
                *slot = value as u32;
            }
        }
    };
}

integral_argument!(u8, "uint8");
integral_argument!(u16, "uint16");
integral_argument!(u32, "uint32");
integral_argument!(i8, "int8");
integral_argument!(i16, "int16");
integral_argument!(i32, "int32");
integral_argument!(u64, "uint32");
integral_argument!(i64, "int32");

impl EventArgument for f32 {
    const TYPE_NAME: &'static str = "float32";
    type Value<'a> = f32;

    fn emit(value: f32, _string_table: &StringTable, slot: &mut u32) {
        *slot = value.to_bits();
    }
}

impl EventArgument for bool {
    const TYPE_NAME: &'static str = "bool";
    type Value<'a> = bool;

    fn emit(value: bool, _string_table: &StringTable, slot: &mut u32) {
        *slot = u32::from(value);
    }
}

/// Marker for string arguments, emitted as an interned string id.
#[derive(Clone, Copy, Debug)]
pub struct Ascii;

impl EventArgument for Ascii {
    const TYPE_NAME: &'static str = "ascii";
    type Value<'a> = &'a str;

    fn emit(value: &str, string_table: &StringTable, slot: &mut u32) {
        *slot = string_table.get_string_id(value) as u32;
    }
}

/// An ordered list of event argument types, realized as tuples of
/// [`EventArgument`] implementors.
pub trait EventArguments {
    /// Total slots consumed by one emission.
    const SLOT_COUNT: usize;

    /// WTF type names, in argument order.
    const TYPE_NAMES: &'static [&'static str];

    /// The tuple of values accepted at an emission site.
    type Values<'a>;

    /// Packs `values` into `slots`, which must hold exactly
    /// [`Self::SLOT_COUNT`] slots.
    fn emit(values: Self::Values<'_>, string_table: &StringTable, slots: &mut [u32]);
}

macro_rules! tuple_arguments {
    ($($arg:ident),*) => {
        impl<$($arg: EventArgument),*> EventArguments for ($($arg,)*) {
            const SLOT_COUNT: usize = 0 $(+ $arg::SLOT_COUNT)*;
            const TYPE_NAMES: &'static [&'static str] = &[$($arg::TYPE_NAME),*];
            type Values<'a> = ($($arg::Value<'a>,)*);

            #[allow(non_snake_case, unused_variables, unused_mut, unused_assignments)]
            fn emit(
                values: Self::Values<'_>,
                string_table: &StringTable,
                slots: &mut [u32],
            ) {
                let ($($arg,)*) = values;
                let mut index = 0;
                $(
                    $arg::emit($arg, string_table, &mut slots[index]);
                    index += $arg::SLOT_COUNT;
                )*
            }
        }
    };
}

tuple_arguments!();
tuple_arguments!(A1);
tuple_arguments!(A1, A2);
tuple_arguments!(A1, A2, A3);
tuple_arguments!(A1, A2, A3, A4);
tuple_arguments!(A1, A2, A3, A4, A5);
tuple_arguments!(A1, A2, A3, A4, A5, A6);
