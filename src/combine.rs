//! Helpers for plugging ordinary functions into stages.

/// Call an N-ary function with an N-tuple.
///
/// Implemented for every `Fn` of one to six arguments.
pub trait PackArgs<Args, R> {
    fn call_packed(&self, args: Args) -> R;
}

macro_rules! impl_pack_args {
    ($($arg:ident),+) => {
        impl<F, R, $($arg),+> PackArgs<($($arg,)+), R> for F
        where
            F: Fn($($arg),+) -> R,
        {
            #[allow(non_snake_case)]
            fn call_packed(&self, ($($arg,)+): ($($arg,)+)) -> R {
                self($($arg),+)
            }
        }
    };
}

impl_pack_args!(A);
impl_pack_args!(A, B);
impl_pack_args!(A, B, C);
impl_pack_args!(A, B, C, D);
impl_pack_args!(A, B, C, D, E);
impl_pack_args!(A, B, C, D, E, G);

/// Turn `f(a, b, ..)` into a function of one tuple item, so a stage whose
/// items are tuples can call it directly:
///
/// ```
/// use staged_pipeline::{pack_args, One2One};
///
/// let stage = One2One::new(pack_args(|x: i32, y: i32| x * y));
/// # let _: One2One<(i32, i32), i32> = stage;
/// ```
pub fn pack_args<Args, R, F>(function: F) -> impl Fn(Args) -> R
where
    F: PackArgs<Args, R>,
{
    move |args: Args| function.call_packed(args)
}

/// Merge a batch of items into one aggregate
pub trait Stack: Sized {
    type Stacked;

    fn stack(batch: Vec<Self>) -> Self::Stacked;
}

/// Vectors are concatenated
impl<T> Stack for Vec<T> {
    type Stacked = Vec<T>;

    fn stack(batch: Vec<Self>) -> Vec<T> {
        batch.into_iter().flatten().collect()
    }
}

macro_rules! impl_stack_tuple {
    ($($t:ident : $v:ident),+) => {
        /// Tuples are stacked component-wise
        impl<$($t),+> Stack for ($($t,)+) {
            type Stacked = ($(Vec<$t>,)+);

            fn stack(batch: Vec<Self>) -> Self::Stacked {
                $(let mut $v = Vec::with_capacity(batch.len());)+
                for ($($t,)+) in batch {
                    $($v.push($t);)+
                }
                ($($v,)+)
            }
        }
    };
}

#[allow(non_snake_case)]
mod tuple_impls {
    use super::Stack;

    impl_stack_tuple!(A: a);
    impl_stack_tuple!(A: a, B: b);
    impl_stack_tuple!(A: a, B: b, C: c);
    impl_stack_tuple!(A: a, B: b, C: c, D: d);
}

/// Default combiner for `Many2One` batches of tuples or vectors
pub fn combine_batches<T: Stack>(batch: Vec<T>) -> T::Stacked {
    T::stack(batch)
}
