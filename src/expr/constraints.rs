use super::Expr;

/// Insertion-ordered, duplicate-free conjunction of boolean expressions.
///
/// Backed by persistent collections so that branching an execution state shares the whole set.
#[derive(Clone, Debug, Default)]
pub struct ConstraintSet {
    ordered: im::Vector<Expr>,
    members: im::HashSet<Expr>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `constraint` unless it is trivially true or already present. Returns whether the
    /// set changed.
    pub fn add(&mut self, constraint: Expr) -> bool {
        debug_assert_eq!(constraint.width(), 1, "constraints must be boolean");
        if constraint.is_true() || self.members.contains(&constraint) {
            return false;
        }
        self.members.insert(constraint);
        self.ordered.push_back(constraint);
        true
    }

    pub fn contains(&self, constraint: Expr) -> bool {
        self.members.contains(&constraint)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Expr> + '_ {
        self.ordered.iter().copied()
    }

    /// True when a constraint folded to `false`; such a set is unsatisfiable.
    pub fn is_trivially_false(&self) -> bool {
        self.members.contains(&Expr::false_())
    }
}

impl FromIterator<Expr> for ConstraintSet {
    fn from_iter<T: IntoIterator<Item = Expr>>(iter: T) -> Self {
        let mut set = ConstraintSet::new();
        for constraint in iter {
            set.add(constraint);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ArrayId, ArraySource};

    #[test]
    fn drops_true_and_duplicates() {
        let arr = ArrayId::new("n", 1, ArraySource::Symbolic);
        let c = Expr::ult(Expr::read(arr, Expr::pointer(0)), Expr::constant(9, 8));
        let mut set = ConstraintSet::new();
        assert!(!set.add(Expr::true_()));
        assert!(set.add(c));
        assert!(!set.add(c));
        assert_eq!(set.len(), 1);

        let branch = set.clone();
        set.add(Expr::false_());
        assert!(set.is_trivially_false());
        assert!(!branch.is_trivially_false());
    }
}
