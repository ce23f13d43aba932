//! Text operation algebra.
//!
//! A [`TextOperation`] is an ordered run of retain/insert/delete components
//! that rewrites one string into another. The builder keeps every operation
//! in canonical form, which makes structural equality meaningful and lets
//! [`compose`](TextOperation::compose) and [`transform`](TextOperation::transform)
//! work by walking two component runs in lockstep.
//!
//! All lengths are counted in Unicode scalar values (`chars().count()`),
//! never in bytes.

use std::cmp::Ordering;

use thiserror::Error;

/// Errors raised when operation preconditions are violated.
///
/// Any of these indicates a bug or corrupted state upstream; callers recover
/// by resynchronising from an authoritative document copy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// An operation was applied or inverted against a document whose length
    /// does not match the operation's base length.
    #[error("operation expects a document of {expected} chars, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// Two operations passed to `transform` do not share a base length.
    #[error("cannot transform operations with base lengths {left} and {right}")]
    BaseMismatch { left: usize, right: usize },
    /// Two operations passed to `compose` do not chain.
    #[error("cannot compose: first operation produces {produced} chars, second consumes {consumed}")]
    ComposeMismatch { produced: usize, consumed: usize },
}

/// A single component of a text operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpComponent {
    /// Advance the cursor over `n` characters of the base document.
    Retain(usize),
    /// Emit the string into the target document.
    Insert(String),
    /// Consume `n` characters of the base document without emitting them.
    Delete(usize),
}

/// A sequence of components rewriting a base document into a target document.
///
/// Canonical form invariants, upheld by the builder methods:
/// - no zero-length component,
/// - no two adjacent components of the same kind,
/// - an insert adjacent to a delete always precedes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextOperation {
    components: Vec<OpComponent>,
    // Number of chars the base document must have.
    base_len: usize,
    // Number of chars the target document will have.
    target_len: usize,
}

impl FromIterator<OpComponent> for TextOperation {
    fn from_iter<T: IntoIterator<Item = OpComponent>>(iter: T) -> Self {
        let mut op = TextOperation::default();
        for component in iter {
            match component {
                OpComponent::Retain(n) => {
                    op.retain(n);
                }
                OpComponent::Insert(s) => {
                    op.insert(s);
                }
                OpComponent::Delete(n) => {
                    op.delete(n);
                }
            }
        }
        op
    }
}

impl TextOperation {
    /// Create an empty operation (a noop on the empty document).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a retain of `n` characters.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(OpComponent::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(OpComponent::Retain(n));
        }
        self
    }

    /// Append an insertion of `text`.
    ///
    /// When the current tail is a delete, the insert is placed in front of it
    /// (merging with an insert two back if present) so that inserts always
    /// precede deletes at the same position.
    pub fn insert(&mut self, text: impl Into<String>) -> &mut Self {
        let text = text.into();
        if text.is_empty() {
            return self;
        }
        self.target_len += text.chars().count();
        match self.components.as_mut_slice() {
            [.., OpComponent::Insert(tail)] => {
                tail.push_str(&text);
            }
            [.., OpComponent::Insert(prev), OpComponent::Delete(_)] => {
                prev.push_str(&text);
            }
            [.., tail @ OpComponent::Delete(_)] => {
                let delete = std::mem::replace(tail, OpComponent::Insert(text));
                self.components.push(delete);
            }
            _ => self.components.push(OpComponent::Insert(text)),
        }
        self
    }

    /// Append a deletion of `n` characters.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(OpComponent::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(OpComponent::Delete(n));
        }
        self
    }

    /// Build the operation for a single editor edit: `deleted` characters
    /// removed and `inserted` text added at `position`, in a document of
    /// `doc_len` characters.
    pub fn from_edit(
        position: usize,
        deleted: usize,
        inserted: &str,
        doc_len: usize,
    ) -> Result<Self, OtError> {
        if position + deleted > doc_len {
            return Err(OtError::LengthMismatch {
                expected: doc_len,
                actual: position + deleted,
            });
        }
        let mut op = TextOperation::default();
        op.retain(position)
            .insert(inserted)
            .delete(deleted)
            .retain(doc_len - position - deleted);
        Ok(op)
    }

    /// Number of characters the base document must have.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Number of characters the target document will have.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// The canonical component run.
    pub fn components(&self) -> &[OpComponent] {
        &self.components
    }

    /// Whether applying this operation leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        matches!(self.components.as_slice(), [] | [OpComponent::Retain(_)])
    }

    /// Apply the operation to `doc`, producing the target document.
    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let doc_len = doc.chars().count();
        if doc_len != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: doc_len,
            });
        }
        let mut target = String::with_capacity(doc.len());
        let mut chars = doc.chars();
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => {
                    target.extend(chars.by_ref().take(*n));
                }
                OpComponent::Insert(text) => {
                    target.push_str(text);
                }
                OpComponent::Delete(n) => {
                    // nth(n - 1) advances past exactly n characters
                    chars.by_ref().nth(*n - 1);
                }
            }
        }
        Ok(target)
    }

    /// Produce the operation that undoes this one when applied to the
    /// operation's output. `doc` must be the base document, because deleted
    /// text has to be recovered from it.
    pub fn invert(&self, doc: &str) -> Result<TextOperation, OtError> {
        let doc_len = doc.chars().count();
        if doc_len != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: doc_len,
            });
        }
        let mut inverse = TextOperation::default();
        let mut chars = doc.chars();
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => {
                    inverse.retain(*n);
                    chars.by_ref().nth(*n - 1);
                }
                OpComponent::Insert(text) => {
                    inverse.delete(text.chars().count());
                }
                OpComponent::Delete(n) => {
                    inverse.insert(chars.by_ref().take(*n).collect::<String>());
                }
            }
        }
        Ok(inverse)
    }

    /// Fuse two sequential operations into one, such that
    /// `self.compose(other)?.apply(doc)` equals
    /// `other.apply(&self.apply(doc)?)` for every valid `doc`.
    pub fn compose(&self, other: &Self) -> Result<Self, OtError> {
        if self.target_len != other.base_len {
            return Err(OtError::ComposeMismatch {
                produced: self.target_len,
                consumed: other.base_len,
            });
        }

        let mut composed = TextOperation::default();
        let mut a_components = self.components.iter().cloned();
        let mut b_components = other.components.iter().cloned();
        let mut a = a_components.next();
        let mut b = b_components.next();

        loop {
            match (&a, &b) {
                (None, None) => break,
                // First-pass deletions never reach the second pass.
                (Some(OpComponent::Delete(n)), _) => {
                    composed.delete(*n);
                    a = a_components.next();
                }
                // Second-pass insertions are independent of the first pass.
                (_, Some(OpComponent::Insert(text))) => {
                    composed.insert(text.clone());
                    b = b_components.next();
                }
                (None, _) | (_, None) => {
                    return Err(OtError::ComposeMismatch {
                        produced: self.target_len,
                        consumed: other.base_len,
                    });
                }
                (Some(OpComponent::Retain(i)), Some(OpComponent::Retain(j))) => {
                    match i.cmp(j) {
                        Ordering::Less => {
                            composed.retain(*i);
                            b = Some(OpComponent::Retain(*j - *i));
                            a = a_components.next();
                        }
                        Ordering::Equal => {
                            composed.retain(*i);
                            a = a_components.next();
                            b = b_components.next();
                        }
                        Ordering::Greater => {
                            composed.retain(*j);
                            a = Some(OpComponent::Retain(*i - *j));
                            b = b_components.next();
                        }
                    }
                }
                (Some(OpComponent::Retain(i)), Some(OpComponent::Delete(j))) => {
                    match i.cmp(j) {
                        Ordering::Less => {
                            composed.delete(*i);
                            b = Some(OpComponent::Delete(*j - *i));
                            a = a_components.next();
                        }
                        Ordering::Equal => {
                            composed.delete(*j);
                            a = a_components.next();
                            b = b_components.next();
                        }
                        Ordering::Greater => {
                            composed.delete(*j);
                            a = Some(OpComponent::Retain(*i - *j));
                            b = b_components.next();
                        }
                    }
                }
                (Some(OpComponent::Insert(text)), Some(OpComponent::Delete(j))) => {
                    // The second pass deletes freshly inserted text, so the
                    // overlap cancels without reaching the composed output.
                    let inserted = text.chars().count();
                    match inserted.cmp(j) {
                        Ordering::Less => {
                            b = Some(OpComponent::Delete(*j - inserted));
                            a = a_components.next();
                        }
                        Ordering::Equal => {
                            a = a_components.next();
                            b = b_components.next();
                        }
                        Ordering::Greater => {
                            a = Some(OpComponent::Insert(chars_from(text, *j)));
                            b = b_components.next();
                        }
                    }
                }
                (Some(OpComponent::Insert(text)), Some(OpComponent::Retain(j))) => {
                    let inserted = text.chars().count();
                    match inserted.cmp(j) {
                        Ordering::Less => {
                            composed.insert(text.clone());
                            b = Some(OpComponent::Retain(*j - inserted));
                            a = a_components.next();
                        }
                        Ordering::Equal => {
                            composed.insert(text.clone());
                            a = a_components.next();
                            b = b_components.next();
                        }
                        Ordering::Greater => {
                            composed.insert(chars_up_to(text, *j));
                            a = Some(OpComponent::Insert(chars_from(text, *j)));
                            b = b_components.next();
                        }
                    }
                }
            }
        }
        Ok(composed)
    }

    /// Reconcile two concurrent operations over the same base document.
    ///
    /// Returns `(a', b')` such that `self.compose(&b')` and
    /// `other.compose(&a')` are the same operation. When both operations
    /// insert at the same position, `self`'s insert ends up first in the
    /// converged document, so argument order decides insertion priority.
    pub fn transform(&self, other: &Self) -> Result<(Self, Self), OtError> {
        if self.base_len != other.base_len {
            return Err(OtError::BaseMismatch {
                left: self.base_len,
                right: other.base_len,
            });
        }

        let mut a_prime = TextOperation::default();
        let mut b_prime = TextOperation::default();
        let mut a_components = self.components.iter().cloned();
        let mut b_components = other.components.iter().cloned();
        let mut a = a_components.next();
        let mut b = b_components.next();

        loop {
            match (&a, &b) {
                (None, None) => break,
                (Some(OpComponent::Insert(text)), _) => {
                    a_prime.insert(text.clone());
                    b_prime.retain(text.chars().count());
                    a = a_components.next();
                }
                (_, Some(OpComponent::Insert(text))) => {
                    a_prime.retain(text.chars().count());
                    b_prime.insert(text.clone());
                    b = b_components.next();
                }
                (None, _) | (_, None) => {
                    return Err(OtError::BaseMismatch {
                        left: self.base_len,
                        right: other.base_len,
                    });
                }
                (Some(OpComponent::Retain(i)), Some(OpComponent::Retain(j))) => {
                    let min = match i.cmp(j) {
                        Ordering::Less => {
                            let min = *i;
                            b = Some(OpComponent::Retain(*j - *i));
                            a = a_components.next();
                            min
                        }
                        Ordering::Equal => {
                            let min = *i;
                            a = a_components.next();
                            b = b_components.next();
                            min
                        }
                        Ordering::Greater => {
                            let min = *j;
                            a = Some(OpComponent::Retain(*i - *j));
                            b = b_components.next();
                            min
                        }
                    };
                    a_prime.retain(min);
                    b_prime.retain(min);
                }
                (Some(OpComponent::Delete(i)), Some(OpComponent::Delete(j))) => {
                    // Overlapping deletions cancel; neither side re-deletes.
                    match i.cmp(j) {
                        Ordering::Less => {
                            b = Some(OpComponent::Delete(*j - *i));
                            a = a_components.next();
                        }
                        Ordering::Equal => {
                            a = a_components.next();
                            b = b_components.next();
                        }
                        Ordering::Greater => {
                            a = Some(OpComponent::Delete(*i - *j));
                            b = b_components.next();
                        }
                    }
                }
                (Some(OpComponent::Delete(i)), Some(OpComponent::Retain(j))) => {
                    let min = match i.cmp(j) {
                        Ordering::Less => {
                            let min = *i;
                            b = Some(OpComponent::Retain(*j - *i));
                            a = a_components.next();
                            min
                        }
                        Ordering::Equal => {
                            let min = *i;
                            a = a_components.next();
                            b = b_components.next();
                            min
                        }
                        Ordering::Greater => {
                            let min = *j;
                            a = Some(OpComponent::Delete(*i - *j));
                            b = b_components.next();
                            min
                        }
                    };
                    a_prime.delete(min);
                }
                (Some(OpComponent::Retain(i)), Some(OpComponent::Delete(j))) => {
                    let min = match i.cmp(j) {
                        Ordering::Less => {
                            let min = *i;
                            b = Some(OpComponent::Delete(*j - *i));
                            a = a_components.next();
                            min
                        }
                        Ordering::Equal => {
                            let min = *i;
                            a = a_components.next();
                            b = b_components.next();
                            min
                        }
                        Ordering::Greater => {
                            let min = *j;
                            a = Some(OpComponent::Retain(*i - *j));
                            b = b_components.next();
                            min
                        }
                    };
                    b_prime.delete(min);
                }
            }
        }

        Ok((a_prime, b_prime))
    }
}

/// The prefix of `text` holding its first `n` characters.
fn chars_up_to(text: &str, n: usize) -> String {
    let end = text
        .char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].to_string()
}

/// The suffix of `text` after its first `n` characters.
fn chars_from(text: &str, n: usize) -> String {
    let start = text
        .char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[start..].to_string()
}
