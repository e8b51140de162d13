//! Aggregate operations: the primitives a grouping processor composes.
//!
//! An operation is the tuple `(create, accumulate, combine, deduct?,
//! finish)`. `combine` must be associative and commutative; `deduct` is its
//! optional inverse and enables incremental sliding-window maintenance.
//!
//! The function slots are reference-counted so an operation can be cloned
//! into both stages of a two-stage setup, and so the stage transformations
//! ([`with_identity_finish`](AggregateOperation1::with_identity_finish),
//! [`with_combining_accumulate`](AggregateOperation1::with_combining_accumulate))
//! can reuse the slots they keep.

use std::sync::Arc;

type CreateFn<A> = Arc<dyn Fn() -> A + Send + Sync>;
/// One accumulate primitive; [`AggregateOperation`] holds one per input
/// ordinal.
pub type AccumulateFn<T, A> = Arc<dyn Fn(&mut A, &T) + Send + Sync>;
type CombineFn<A> = Arc<dyn Fn(&mut A, &A) + Send + Sync>;
type FinishFn<A, R> = Arc<dyn Fn(&A) -> R + Send + Sync>;

/// Wrap a plain closure into an accumulate slot for
/// [`AggregateOperation::new`].
pub fn accumulate_fn<T, A>(
    f: impl Fn(&mut A, &T) + Send + Sync + 'static,
) -> AccumulateFn<T, A> {
    Arc::new(f)
}

/// An aggregate operation over a single input stream.
pub struct AggregateOperation1<T, A, R> {
    create: CreateFn<A>,
    accumulate: AccumulateFn<T, A>,
    combine: CombineFn<A>,
    deduct: Option<CombineFn<A>>,
    finish: FinishFn<A, R>,
}

impl<T, A, R> Clone for AggregateOperation1<T, A, R> {
    fn clone(&self) -> Self {
        Self {
            create: self.create.clone(),
            accumulate: self.accumulate.clone(),
            combine: self.combine.clone(),
            deduct: self.deduct.clone(),
            finish: self.finish.clone(),
        }
    }
}

impl<T, A: 'static, R> AggregateOperation1<T, A, R> {
    /// Assemble an operation from its primitives.
    pub fn new(
        create: impl Fn() -> A + Send + Sync + 'static,
        accumulate: impl Fn(&mut A, &T) + Send + Sync + 'static,
        combine: impl Fn(&mut A, &A) + Send + Sync + 'static,
        finish: impl Fn(&A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            create: Arc::new(create),
            accumulate: Arc::new(accumulate),
            combine: Arc::new(combine),
            deduct: None,
            finish: Arc::new(finish),
        }
    }

    /// Attach a `deduct` primitive (the inverse of `combine`).
    pub fn with_deduct(mut self, deduct: impl Fn(&mut A, &A) + Send + Sync + 'static) -> Self {
        self.deduct = Some(Arc::new(deduct));
        self
    }

    /// Create a fresh accumulator.
    pub fn create(&self) -> A {
        (self.create)()
    }

    /// Fold one item into the accumulator.
    pub fn accumulate(&self, acc: &mut A, item: &T) {
        (self.accumulate)(acc, item)
    }

    /// Merge another accumulator into `acc`.
    pub fn combine(&self, acc: &mut A, other: &A) {
        (self.combine)(acc, other)
    }

    /// The optional inverse of `combine`.
    pub fn deduct_fn(&self) -> Option<&(dyn Fn(&mut A, &A) + Send + Sync)> {
        self.deduct.as_deref()
    }

    /// Convert a final accumulator into the result.
    pub fn finish(&self, acc: &A) -> R {
        (self.finish)(acc)
    }

    /// Stage-1 transformation: replace `finish` with identity so the raw
    /// accumulator travels downstream.
    pub fn with_identity_finish(self) -> AggregateOperation1<T, A, A>
    where
        A: Clone,
    {
        AggregateOperation1 {
            create: self.create,
            accumulate: self.accumulate,
            combine: self.combine,
            deduct: self.deduct,
            finish: Arc::new(A::clone),
        }
    }

    /// Stage-2 transformation: accumulate by combining partial accumulators
    /// extracted from the upstream items.
    pub fn with_combining_accumulate<U>(
        self,
        get_acc: impl Fn(&U) -> &A + Send + Sync + 'static,
    ) -> AggregateOperation1<U, A, R> {
        let combine = self.combine.clone();
        AggregateOperation1 {
            create: self.create,
            accumulate: Arc::new(move |acc: &mut A, item: &U| combine(acc, get_acc(item))),
            combine: self.combine,
            deduct: self.deduct,
            finish: self.finish,
        }
    }

    /// Widen to a multi-input operation with this operation's `accumulate`
    /// serving ordinal 0.
    pub fn into_multi(self) -> AggregateOperation<T, A, R> {
        AggregateOperation {
            create: self.create,
            accumulates: vec![self.accumulate],
            combine: self.combine,
            finish: self.finish,
        }
    }
}

/// An aggregate operation over `n` input ordinals, with one accumulate
/// primitive per ordinal. Used by the co-group processor.
pub struct AggregateOperation<T, A, R> {
    create: CreateFn<A>,
    accumulates: Vec<AccumulateFn<T, A>>,
    combine: CombineFn<A>,
    finish: FinishFn<A, R>,
}

impl<T, A, R> Clone for AggregateOperation<T, A, R> {
    fn clone(&self) -> Self {
        Self {
            create: self.create.clone(),
            accumulates: self.accumulates.clone(),
            combine: self.combine.clone(),
            finish: self.finish.clone(),
        }
    }
}

impl<T, A: 'static, R> AggregateOperation<T, A, R> {
    /// Assemble a multi-input operation. `accumulates[i]` handles items
    /// arriving on ordinal `i`.
    pub fn new(
        create: impl Fn() -> A + Send + Sync + 'static,
        accumulates: Vec<AccumulateFn<T, A>>,
        combine: impl Fn(&mut A, &A) + Send + Sync + 'static,
        finish: impl Fn(&A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            create: Arc::new(create),
            accumulates,
            combine: Arc::new(combine),
            finish: Arc::new(finish),
        }
    }

    /// Number of input ordinals this operation accepts.
    pub fn arity(&self) -> usize {
        self.accumulates.len()
    }

    /// Create a fresh accumulator.
    pub fn create(&self) -> A {
        (self.create)()
    }

    /// Fold one item from the given input ordinal into the accumulator.
    pub fn accumulate(&self, ordinal: usize, acc: &mut A, item: &T) {
        assert!(
            ordinal < self.accumulates.len(),
            "no accumulate primitive for ordinal {ordinal}"
        );
        (self.accumulates[ordinal])(acc, item)
    }

    /// Merge another accumulator into `acc`.
    pub fn combine(&self, acc: &mut A, other: &A) {
        (self.combine)(acc, other)
    }

    /// Convert a final accumulator into the result.
    pub fn finish(&self, acc: &A) -> R {
        (self.finish)(acc)
    }

    /// Stage-1 transformation: replace `finish` with identity.
    pub fn with_identity_finish(self) -> AggregateOperation<T, A, A>
    where
        A: Clone,
    {
        AggregateOperation {
            create: self.create,
            accumulates: self.accumulates,
            combine: self.combine,
            finish: Arc::new(A::clone),
        }
    }

    /// Stage-2 transformation: accumulate by combining partial accumulators
    /// extracted from the upstream items.
    pub fn with_combining_accumulate<U>(
        self,
        get_acc: impl Fn(&U) -> &A + Send + Sync + 'static,
    ) -> AggregateOperation<U, A, R> {
        let combine = self.combine.clone();
        AggregateOperation {
            create: self.create,
            accumulates: vec![Arc::new(move |acc: &mut A, item: &U| {
                combine(acc, get_acc(item))
            })],
            combine: self.combine,
            finish: self.finish,
        }
    }
}

/// Count the items in the group.
pub fn counting<T>() -> AggregateOperation1<T, i64, i64> {
    AggregateOperation1::new(
        || 0i64,
        |acc, _item: &T| *acc += 1,
        |acc, other| *acc += other,
        |acc| *acc,
    )
    .with_deduct(|acc, other| *acc -= other)
}

/// Sum the `i64` values extracted from the items.
pub fn summing_i64<T>(
    get_value: impl Fn(&T) -> i64 + Send + Sync + 'static,
) -> AggregateOperation1<T, i64, i64> {
    AggregateOperation1::new(
        || 0i64,
        move |acc, item: &T| *acc += get_value(item),
        |acc, other| *acc += other,
        |acc| *acc,
    )
    .with_deduct(|acc, other| *acc -= other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let op = counting::<&str>();
        let mut acc = op.create();
        op.accumulate(&mut acc, &"a");
        op.accumulate(&mut acc, &"b");
        assert_eq!(op.finish(&acc), 2);
    }

    #[test]
    fn test_summing_combine_and_deduct() {
        let op = summing_i64(|v: &i64| *v);
        let mut a = op.create();
        op.accumulate(&mut a, &3);
        let mut b = op.create();
        op.accumulate(&mut b, &4);

        op.combine(&mut a, &b);
        assert_eq!(op.finish(&a), 7);

        let deduct = op.deduct_fn().expect("summing has deduct");
        deduct(&mut a, &b);
        assert_eq!(op.finish(&a), 3);
    }

    #[test]
    fn test_identity_finish_exposes_accumulator() {
        let op = summing_i64(|v: &i64| *v).with_identity_finish();
        let mut acc = op.create();
        op.accumulate(&mut acc, &5);
        assert_eq!(op.finish(&acc), 5i64);
    }

    #[test]
    fn test_combining_accumulate_equivalence() {
        // combine-accumulating partial sums must equal direct accumulation
        let direct = summing_i64(|v: &i64| *v);
        let mut want = direct.create();
        for v in [1i64, 2, 3, 4] {
            direct.accumulate(&mut want, &v);
        }

        let stage2 = summing_i64(|v: &i64| *v).with_combining_accumulate(|partial: &i64| partial);
        let mut got = stage2.create();
        for partial in [3i64, 7] {
            stage2.accumulate(&mut got, &partial);
        }
        assert_eq!(stage2.finish(&got), direct.finish(&want));
    }

    #[test]
    fn test_multi_input_accumulates_per_ordinal() {
        let op: AggregateOperation<(i64, i64), i64, i64> = AggregateOperation::new(
            || 0i64,
            vec![
                accumulate_fn(|acc, item: &(i64, i64)| *acc += item.0),
                accumulate_fn(|acc, item: &(i64, i64)| *acc += item.1),
            ],
            |acc, other| *acc += other,
            |acc| *acc,
        );

        let mut acc = op.create();
        op.accumulate(0, &mut acc, &(10, 99));
        op.accumulate(1, &mut acc, &(99, 5));
        assert_eq!(op.finish(&acc), 15);
        assert_eq!(op.arity(), 2);
    }
}
