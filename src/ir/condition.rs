//! Condition trees for guarded insertions (spec.md §3 "Condition" row).
//!
//! A [`Condition`] is built by the API as a tree of `AND`/`OR`/comparison
//! nodes. Before it can be lowered to a compare-and-branch prologue by
//! [`crate::arch::ArchDriver::add_conditions`] (spec.md §6), it is
//! flattened into the "serialised form" spec.md describes: a linear list
//! of leaves, each carrying whether the compare should be taken in its
//! negated sense, which leaf to continue at on failure, and the
//! instructions to run if the whole condition is false (the "else" path).

use crate::entities::InsnId;

/// A single scalar comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<` (signed)
    Lt,
    /// `<=` (signed)
    Le,
    /// `>` (signed)
    Gt,
    /// `>=` (signed)
    Ge,
}

/// One leaf comparison: some architecture-defined operand versus an
/// immediate value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Comparison {
    /// Opaque operand identifier (register number, memory slot id, ...)
    /// meaningful only to the architecture driver.
    pub operand: u32,
    /// The comparison to perform.
    pub op: CompareOp,
    /// The immediate value to compare against.
    pub value: i64,
}

/// A condition tree, as built by the API.
#[derive(Clone, Debug)]
pub enum Condition {
    /// A single comparison.
    Leaf(Comparison),
    /// Both children must hold.
    And(Box<Condition>, Box<Condition>),
    /// Either child must hold.
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Flatten this tree into the serialised leaf list spec.md §3
    /// describes, ready to hand to the architecture driver.
    ///
    /// Short-circuit semantics are preserved by the `next_leaf_on_fail`
    /// links: for an `AND`, failing a leaf skips straight to the overall
    /// failure (the else branch); for an `OR`, failing a leaf falls
    /// through to try the next disjunct, and only the last disjunct's
    /// failure reaches the else branch.
    pub fn serialize(&self, else_code: Vec<InsnId>) -> Vec<SerialisedLeaf> {
        let mut out = Vec::new();
        self.serialize_into(&mut out, true);
        if let Some(last) = out.last_mut() {
            last.is_final = true;
        }
        for leaf in &mut out {
            leaf.else_code = else_code.clone();
        }
        out
    }

    fn serialize_into(&self, out: &mut Vec<SerialisedLeaf>, take_if_true: bool) {
        match self {
            Condition::Leaf(cmp) => {
                out.push(SerialisedLeaf {
                    comparison: *cmp,
                    opposite_to_take: !take_if_true,
                    next_leaf_on_fail: None,
                    else_code: Vec::new(),
                    is_final: false,
                });
            }
            Condition::And(a, b) => {
                // A failing leaf of an AND must abort the whole chain, so
                // both children serialize with "fail means go to else"
                // (no `next_leaf_on_fail` rewritten here; the None default
                // already means "go to else").
                a.serialize_into(out, true);
                b.serialize_into(out, true);
            }
            Condition::Or(a, b) => {
                // A failing leaf of an OR must fall through to the next
                // disjunct rather than aborting; patch the link after
                // `a` is serialized once we know where `b` starts.
                let start = out.len();
                a.serialize_into(out, true);
                let mid = out.len();
                b.serialize_into(out, true);
                for leaf in &mut out[start..mid] {
                    if leaf.next_leaf_on_fail.is_none() {
                        leaf.next_leaf_on_fail = Some(mid);
                    }
                }
            }
        }
    }
}

/// One leaf of a serialised condition, ready for
/// [`crate::arch::ArchDriver::add_conditions`].
#[derive(Clone, Debug)]
pub struct SerialisedLeaf {
    /// The comparison to perform.
    pub comparison: Comparison,
    /// Whether the architecture driver should emit the branch that takes
    /// the *opposite* of `comparison` (used to turn "continue only if
    /// true" into "skip over the guarded code if false").
    pub opposite_to_take: bool,
    /// If this leaf's branch is taken (comparison failed in the relevant
    /// sense) and the chain isn't finished, which leaf index to continue
    /// evaluating instead of falling through to `else_code`. `None` means
    /// "go straight to `else_code`".
    pub next_leaf_on_fail: Option<usize>,
    /// Instructions to execute if the whole condition evaluates false.
    pub else_code: Vec<InsnId>,
    /// True for the last leaf in the chain.
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    fn cmp(v: i64) -> Condition {
        Condition::Leaf(Comparison {
            operand: 0,
            op: CompareOp::Eq,
            value: v,
        })
    }

    #[test]
    fn leaf_serializes_to_single_entry() {
        let c = cmp(1);
        let leaves = c.serialize(vec![InsnId::new(5)]);
        assert_eq!(leaves.len(), 1);
        assert!(leaves[0].is_final);
        assert_eq!(leaves[0].else_code, vec![InsnId::new(5)]);
    }

    #[test]
    fn and_chains_without_fallthrough_links() {
        let c = Condition::And(Box::new(cmp(1)), Box::new(cmp(2)));
        let leaves = c.serialize(vec![]);
        assert_eq!(leaves.len(), 2);
        assert!(leaves[0].next_leaf_on_fail.is_none());
        assert!(leaves[1].is_final);
    }

    #[test]
    fn or_links_first_leaf_to_second_on_fail() {
        let c = Condition::Or(Box::new(cmp(1)), Box::new(cmp(2)));
        let leaves = c.serialize(vec![]);
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].next_leaf_on_fail, Some(1));
        assert!(leaves[1].next_leaf_on_fail.is_none());
    }
}
