#![warn(missing_docs)]
#![doc(test(no_crate_inject))]
#![doc(test(attr(deny(unused, future_incompatible))))]

//! This crate discovers the hierarchical structure hidden in a table of categorical columns and
//! turns it into a broadcast algebra: values defined at different levels of the hierarchy can be
//! combined without the caller ever writing reshape/repeat/gather code.
//!
//! Columns stand in a *functional dependency* relation when every value of one column co-occurs
//! with exactly one value of the other. [`GroupSet::build`] classifies every pair of columns as
//! parent/child (the coarser column is determined by the finer one), twin (a bijection, two
//! labelings of the same information), or unrelated, and models each column as a [`Group`]: an
//! ordered axis of distinct members. A [`Representation`] is a minimal set of groups describing an
//! n-dimensional shape, and [`Representation::map`] translates a value from one representation's
//! shape into another's by pure indexing.
//!
//! ```
//! use groupcast::{Frame, GroupSet};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let mut frame = Frame::new();
//! frame.push_column("region", &["north", "north", "south", "south"]);
//! frame.push_column("city", &["oslo", "bergen", "rome", "milan"]);
//! let set = GroupSet::build(&frame).unwrap();
//!
//! // Each city belongs to exactly one region, so "region" is a parent of "city".
//! let per_region = set.representation(&["region"]).unwrap();
//! let per_city = set.representation(&["city"]).unwrap();
//!
//! // A value with one entry per region, viewed with one entry per city.
//! let value = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 2.0]).unwrap();
//! let spread = per_region.map(&value, &per_city).unwrap();
//! assert_eq!(spread.shape(), &[4]);
//! assert_eq!(spread.as_slice().unwrap(), &[1.0, 1.0, 2.0, 2.0]);
//! ```
//!
//! Everything is computed in one batch pass: after [`GroupSet::build`] returns, the group set and
//! all per-member link tables are immutable, so a `GroupSet` can be shared freely across threads
//! and every representation or mapping derived from it is a pure function of immutable data.

pub use sorted_iter;

use lasso::{Rodeo, RodeoResolver, Spur};
use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use smallvec::SmallVec;
use sorted_iter::assume::AssumeSortedByItemExt;
use sorted_iter::sorted_iterator::SortedByItem;
use sorted_iter::SortedIterator;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::iter;
use thiserror::Error;

/// Errors detected while validating a [`Frame`] or building a [`GroupSet`] from it.
///
/// All of these are structural facts about the input schema: they are reported eagerly, they are
/// never transient, and each names the offending column so the caller can fix the table.
#[derive(Debug, Error)]
pub enum RelationError {
    /// The frame had no columns, or columns with no rows.
    #[error("the grouping table is empty")]
    EmptyTable,

    /// A column's length differed from the first column's.
    #[error("column {column:?} has {actual} rows but the table has {expected}")]
    LengthMismatch {
        /// Name of the offending column.
        column: String,
        /// Row count of the table, taken from the first column.
        expected: usize,
        /// Row count of the offending column.
        actual: usize,
    },

    /// Two columns shared the same name.
    #[error("duplicate grouping column {column:?}")]
    DuplicateColumn {
        /// The name that appeared more than once.
        column: String,
    },

    /// A cell held no label. Missing values would make the functional-dependency test only
    /// approximately true, and an approximate hierarchy is worse than none.
    #[error("column {column:?} is missing a value at row {row}")]
    MissingValue {
        /// Column containing the empty cell.
        column: String,
        /// Zero-based row of the empty cell.
        row: usize,
    },

    /// A column name was requested that the group set does not contain.
    #[error("no grouping column named {column:?}")]
    UnknownColumn {
        /// The unknown name.
        column: String,
    },

    /// The inferred dependency graph ordered a column before one of its parents. The
    /// cardinality-based pair test should make this impossible; seeing it means the input is
    /// corrupt and must be corrected.
    #[error("the dependency structure of column {column:?} is cyclic")]
    Cycle {
        /// A column participating in the cycle.
        column: String,
    },
}

/// Errors from [`Representation::map`] and [`Representation::index_arrays`].
#[derive(Debug, Error)]
pub enum MapError {
    /// The value handed to `map` was not shaped like its source representation.
    #[error("value of shape {actual:?} does not match source representation shape {expected:?}")]
    ShapeMismatch {
        /// The source representation's shape.
        expected: Vec<usize>,
        /// The value's actual shape.
        actual: Vec<usize>,
    },

    /// A source group has no twin, no child, and no exact combination of ancestors in the target
    /// representation, so no index mapping exists.
    #[error("group {group:?} cannot be expressed in target representation {target}")]
    Unreachable {
        /// The source group that could not be resolved.
        group: String,
        /// The target representation, rendered for the message.
        target: String,
    },

    /// The target representation is strictly coarser than a source group: squeezing the value
    /// into it would need an aggregation rule (sum? mean? last?), which this crate refuses to
    /// pick. Repeating a coarse value across a finer shape is always allowed; the reverse
    /// direction never is.
    #[error("mapping group {group:?} into coarser representation {target} would require an aggregation rule")]
    AmbiguousBroadcast {
        /// The source group whose detail would be lost.
        group: String,
        /// The target representation, rendered for the message.
        target: String,
    },
}

/// Identifies a [`Group`] within its owning [`GroupSet`].
///
/// Identifiers are assigned in construction order, parents before children, so a parent's id is
/// always smaller than the ids of all of its children.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupId(u32);

impl GroupId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A sorted set of [`GroupId`]s.
///
/// Relation structures are small (bounded by the column count, not the row count), so sets of up
/// to four groups stay inline without heap allocation.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct GroupIdSet(SmallVec<[GroupId; 4]>);

impl GroupIdSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        GroupIdSet::default()
    }

    /// The number of groups in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no groups.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if the set contains the given group.
    pub fn contains(&self, id: GroupId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    /// Returns an iterator over the groups in the set, in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = GroupId> + SortedByItem + Clone + '_ {
        self.0.iter().copied().assume_sorted_by_item()
    }

    /// Returns `true` if `other` contains every group that `self` does.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len() && self.iter().intersection(other.iter()).eq(self.iter())
    }

    /// Returns the groups present in both sets.
    pub fn intersection(&self, other: &Self) -> Self {
        GroupIdSet(self.iter().intersection(other.iter()).collect())
    }

    fn insert(&mut self, id: GroupId) {
        if let Err(at) = self.0.binary_search(&id) {
            self.0.insert(at, id);
        }
    }

    fn first(&self) -> Option<GroupId> {
        self.0.first().copied()
    }
}

impl iter::FromIterator<GroupId> for GroupIdSet {
    fn from_iter<I: IntoIterator<Item = GroupId>>(iter: I) -> Self {
        let mut ids: SmallVec<[GroupId; 4]> = iter.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        GroupIdSet(ids)
    }
}

/// A read-only snapshot of the categorical grouping columns of one table.
///
/// Only the grouping columns belong here; measurement values live with the caller. Validation
/// (rectangularity, unique names, no missing labels) happens in [`GroupSet::build`], so pushing
/// columns never fails.
///
/// ```
/// use groupcast::Frame;
///
/// let mut frame = Frame::new();
/// frame
///     .push_column("building", &["a", "a", "b", "b"])
///     .push_column("sensor", &["s", "t", "u", "v"])
///     .push_index_column("observation");
/// assert_eq!(frame.rows(), 4);
/// assert_eq!(frame.width(), 3);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Frame {
    columns: Vec<(String, Vec<String>)>,
}

impl Frame {
    /// Creates an empty frame.
    pub fn new() -> Self {
        Frame::default()
    }

    /// Appends a categorical column. Labels are compared as strings; anything printable works.
    pub fn push_column<N, I, S>(&mut self, name: N, values: I) -> &mut Self
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let values = values.into_iter().map(|v| v.to_string()).collect();
        self.columns.push((name.into(), values));
        self
    }

    /// Appends a column with one distinct label per current row: the finest possible axis, a
    /// child of every other column. Useful as the observation axis of a model.
    pub fn push_index_column<N: Into<String>>(&mut self, name: N) -> &mut Self {
        let values = (0..self.rows()).map(|row| row.to_string()).collect();
        self.columns.push((name.into(), values));
        self
    }

    /// Appends a single-member column spanning the current rows: the coarsest possible axis, a
    /// parent of every other column. Useful as a global root that every hierarchy hangs from.
    pub fn push_constant_column<N: Into<String>>(&mut self, name: N, label: &str) -> &mut Self {
        let values = vec![label.to_string(); self.rows()];
        self.columns.push((name.into(), values));
        self
    }

    /// The number of rows, taken from the first column.
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, values)| values.len())
    }

    /// The number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Returns an iterator over the column names, in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}

/// One distinct value of a grouping column, with a stable index in `[0, group.len())`.
///
/// Members are created once, at group construction, in first-appearance order, and never change.
/// A member's correspondence with members of parent and twin groups is stored on the owning
/// [`Group`] as precomputed index arrays.
#[derive(Clone, Copy, Debug)]
pub struct Member {
    label: Spur,
    index: u32,
}

impl Member {
    /// The member's position within its group.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// One categorical column modeled as a discrete axis: ordered members plus links to every group
/// it stands in a relation with.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    name: Spur,
    members: Vec<Member>,
    parents: GroupIdSet,
    children: GroupIdSet,
    twins: GroupIdSet,
    links: HashMap<GroupId, Vec<u32>>,
}

impl Group {
    /// This group's id within its [`GroupSet`].
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// The number of members (distinct labels) in the group.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the group has no members. Never true for a group built from a validated
    /// frame.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The members of the group, in first-appearance order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// The groups this group is determined by, transitively closed: every ancestor, not just the
    /// immediate ones. The parent relation is irreflexive and antisymmetric.
    pub fn parents(&self) -> &GroupIdSet {
        &self.parents
    }

    /// The groups determined by this group, transitively closed.
    pub fn children(&self) -> &GroupIdSet {
        &self.children
    }

    /// The groups in bijection with this one. Twinhood is an equivalence relation and the set
    /// always contains the group itself.
    pub fn twins(&self) -> &GroupIdSet {
        &self.twins
    }

    /// The precomputed member link to an ancestor or twin group: entry `m` is the index of the
    /// member of `other` that member `m` of this group belongs to. Returns `None` if `other` is
    /// neither an ancestor nor a twin.
    pub fn link(&self, other: GroupId) -> Option<&[u32]> {
        self.links.get(&other).map(|link| link.as_slice())
    }
}

/// Tests whether `other` is constant within every member of `codes` (both given as per-row member
/// codes). On success, returns for each member of `codes` the member of `other` it falls inside;
/// this is simultaneously the functional-dependency test and the link array for the pair.
fn functional_map(codes: &[u32], other: &[u32], cardinality: usize) -> Option<Vec<u32>> {
    const UNSET: u32 = u32::MAX;
    let mut link = vec![UNSET; cardinality];
    for (&own, &theirs) in codes.iter().zip(other) {
        let slot = &mut link[own as usize];
        if *slot == UNSET {
            *slot = theirs;
        } else if *slot != theirs {
            return None;
        }
    }
    Some(link)
}

struct RawColumn {
    name: String,
    members: Vec<Spur>,
    codes: Vec<u32>,
}

/// The complete, immutable set of [`Group`]s derived from one table.
///
/// Built in one batch pass by [`GroupSet::build`]; afterwards the groups, members and link tables
/// never change, so a `GroupSet` is safe to share across threads and every [`Representation`]
/// derived from it borrows immutable data.
pub struct GroupSet {
    groups: Vec<Group>,
    by_name: HashMap<String, GroupId>,
    resolver: RodeoResolver<Spur>,
}

impl GroupSet {
    /// Discovers the relation structure of `frame` and builds a group per column.
    ///
    /// The pairwise classification costs one pass over the rows per ordered column pair; groups
    /// are then constructed in dependency order, parents before children, so every member link is
    /// resolved immediately and mappings later never scan the rows again.
    ///
    /// ```
    /// use groupcast::{Frame, GroupSet};
    ///
    /// let mut frame = Frame::new();
    /// frame.push_column("week", &["w1", "w1", "w2", "w2"]);
    /// frame.push_column("day", &["mon", "tue", "mon", "tue"]);
    /// let set = GroupSet::build(&frame).unwrap();
    /// assert_eq!(set.get("week").unwrap().len(), 2);
    /// // "week" and "day" vary independently here: neither determines the other.
    /// assert!(set.get("week").unwrap().children().is_empty());
    /// ```
    pub fn build(frame: &Frame) -> Result<GroupSet, RelationError> {
        if frame.width() == 0 || frame.rows() == 0 {
            return Err(RelationError::EmptyTable);
        }
        let rows = frame.rows();

        let mut rodeo = Rodeo::new();
        let mut cols: Vec<RawColumn> = Vec::with_capacity(frame.width());
        for (name, values) in &frame.columns {
            if values.len() != rows {
                return Err(RelationError::LengthMismatch {
                    column: name.clone(),
                    expected: rows,
                    actual: values.len(),
                });
            }
            if cols.iter().any(|col| &col.name == name) {
                return Err(RelationError::DuplicateColumn {
                    column: name.clone(),
                });
            }

            let mut members = Vec::new();
            let mut index_of = HashMap::new();
            let mut codes = Vec::with_capacity(rows);
            for (row, label) in values.iter().enumerate() {
                if label.is_empty() {
                    return Err(RelationError::MissingValue {
                        column: name.clone(),
                        row,
                    });
                }
                let label = rodeo.get_or_intern(label);
                let next = members.len() as u32;
                let code = *index_of.entry(label).or_insert_with(|| {
                    members.push(label);
                    next
                });
                codes.push(code);
            }
            cols.push(RawColumn {
                name: name.clone(),
                members,
                codes,
            });
        }

        // maps[i][j] holds the link array when column j is constant within every member of column
        // i, i.e. when j is coarser than or equivalent to i.
        let n = cols.len();
        let mut maps: Vec<Vec<Option<Vec<u32>>>> = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = Vec::with_capacity(n);
            for j in 0..n {
                row.push(if i == j {
                    None
                } else {
                    functional_map(&cols[i].codes, &cols[j].codes, cols[i].members.len())
                });
            }
            maps.push(row);
        }

        // parent_of[j][i]: j is a strict ancestor of i. Mutual determination forces equal
        // cardinality, so those pairs classify as twins rather than forming a two-cycle.
        let mut parent_of = vec![vec![false; n]; n];
        let mut twin_of = vec![vec![false; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                parent_of[j][i] =
                    maps[i][j].is_some() && cols[j].members.len() < cols[i].members.len();
                twin_of[i][j] = maps[i][j].is_some() && maps[j][i].is_some();
            }
        }
        for i in 0..n {
            for j in i + 1..n {
                let relation = if twin_of[i][j] {
                    "twin"
                } else if parent_of[i][j] {
                    "parent"
                } else if parent_of[j][i] {
                    "child"
                } else {
                    "unrelated"
                };
                debug!(
                    "column {:?} is {} of column {:?}",
                    cols[i].name, relation, cols[j].name
                );
            }
        }

        // Groups with fewer ancestors are coarser. Ranking by ancestor count gives a construction
        // order where every parent is built before the columns it determines.
        let rank: Vec<usize> = (0..n)
            .map(|i| (0..n).filter(|&j| parent_of[j][i]).count())
            .collect();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (rank[i], i));
        for i in 0..n {
            for j in 0..n {
                if parent_of[j][i] && rank[j] >= rank[i] {
                    return Err(RelationError::Cycle {
                        column: cols[i].name.clone(),
                    });
                }
            }
        }

        let mut new_id = vec![GroupId(0); n];
        for (at, &i) in order.iter().enumerate() {
            new_id[i] = GroupId(at as u32);
        }

        let mut groups = Vec::with_capacity(n);
        let mut by_name = HashMap::with_capacity(n);
        for (at, &i) in order.iter().enumerate() {
            let id = GroupId(at as u32);
            let name = rodeo.get_or_intern(&cols[i].name);
            let members = cols[i]
                .members
                .iter()
                .enumerate()
                .map(|(index, &label)| Member {
                    label,
                    index: index as u32,
                })
                .collect();

            let mut parents = GroupIdSet::new();
            let mut twins = GroupIdSet::new();
            let mut links = HashMap::new();
            twins.insert(id);
            for j in 0..n {
                if parent_of[j][i] {
                    parents.insert(new_id[j]);
                }
                if i != j && twin_of[i][j] {
                    twins.insert(new_id[j]);
                }
                if let Some(link) = maps[i][j].take() {
                    links.insert(new_id[j], link);
                }
            }

            by_name.insert(cols[i].name.clone(), id);
            groups.push(Group {
                id,
                name,
                members,
                parents,
                children: GroupIdSet::new(),
                twins,
                links,
            });
        }

        for at in 0..groups.len() {
            let child = groups[at].id;
            let parents: Vec<GroupId> = groups[at].parents.iter().collect();
            for parent in parents {
                groups[parent.index()].children.insert(child);
            }
        }

        // The pairwise test is itself transitive, so the parent sets come out transitively
        // closed; the mapping search relies on that.
        for group in &groups {
            for parent in group.parents.iter() {
                debug_assert!(groups[parent.index()].parents.is_subset(&group.parents));
            }
        }

        info!("built {} groups from {} rows", n, rows);
        Ok(GroupSet {
            groups,
            by_name,
            resolver: rodeo.into_resolver(),
        })
    }

    /// The number of groups (one per column of the input frame).
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns `true` if the set contains no groups. Never true for a built set.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns an iterator over all groups, in construction order (parents before children).
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    /// Looks a group up by its column name.
    pub fn get(&self, name: &str) -> Option<&Group> {
        self.by_name.get(name).map(|&id| &self.groups[id.index()])
    }

    /// Returns the group with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` came from a different group set.
    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.index()]
    }

    /// The column name of the given group.
    pub fn name(&self, id: GroupId) -> &str {
        self.resolver.resolve(&self.group(id).name)
    }

    /// The label of the given member.
    pub fn label(&self, member: &Member) -> &str {
        self.resolver.resolve(&member.label)
    }

    /// Returns `true` if the two groups are in bijection (or identical).
    pub fn are_twins(&self, a: GroupId, b: GroupId) -> bool {
        self.group(a).twins.contains(b)
    }

    /// Returns `true` if `ancestor` is a strict ancestor of `descendant`.
    pub fn is_ancestor_of(&self, ancestor: GroupId, descendant: GroupId) -> bool {
        self.group(descendant).parents.contains(ancestor)
    }

    /// The strict ancestors shared by both groups.
    pub fn common_ancestors(&self, a: GroupId, b: GroupId) -> GroupIdSet {
        self.group(a).parents.intersection(&self.group(b).parents)
    }

    /// The canonical representative of a group's twin class: the twin with the smallest id.
    fn twin_class(&self, id: GroupId) -> GroupId {
        // Twin sets are never empty: they contain the group itself.
        self.group(id).twins.first().unwrap()
    }

    /// The ordered member labels of every group, keyed by column name: the coordinate arrays a
    /// downstream tensor or modeling engine attaches as axis labels.
    ///
    /// ```
    /// use groupcast::{Frame, GroupSet};
    ///
    /// let mut frame = Frame::new();
    /// frame.push_column("city", &["oslo", "bergen", "oslo", "rome"]);
    /// let set = GroupSet::build(&frame).unwrap();
    /// let coords = set.coords();
    /// assert_eq!(coords["city"], vec!["oslo", "bergen", "rome"]);
    /// ```
    pub fn coords(&self) -> BTreeMap<&str, Vec<&str>> {
        self.groups
            .iter()
            .map(|group| {
                let labels = group.members.iter().map(|m| self.label(m)).collect();
                (self.resolver.resolve(&group.name), labels)
            })
            .collect()
    }

    /// Builds the reduced [`Representation`] of the named columns.
    ///
    /// ```
    /// use groupcast::{Frame, GroupSet};
    ///
    /// let mut frame = Frame::new();
    /// frame.push_column("region", &["north", "north", "south", "south"]);
    /// frame.push_column("city", &["oslo", "bergen", "rome", "milan"]);
    /// let set = GroupSet::build(&frame).unwrap();
    ///
    /// // "region" is subsumed by the finer "city" axis.
    /// let repr = set.representation(&["region", "city"]).unwrap();
    /// assert_eq!(repr.shape(), vec![4]);
    /// ```
    pub fn representation(&self, names: &[&str]) -> Result<Representation<'_>, RelationError> {
        let mut ids = Vec::with_capacity(names.len());
        for &name in names {
            match self.by_name.get(name) {
                Some(&id) => ids.push(id),
                None => {
                    return Err(RelationError::UnknownColumn {
                        column: name.to_owned(),
                    })
                }
            }
        }
        Ok(Representation::new(self, ids))
    }
}

/// A minimal, non-redundant, canonically ordered set of [`Group`]s describing an n-dimensional
/// shape.
///
/// No group in a representation is a twin or a child of another: every group contributes an
/// independent, non-subsumed axis. Axes are kept in lexicographic column-name order, which makes
/// the shape independent of insertion order. Equality and hashing compare twin classes, so two
/// representations built from different but bijective columns compare equal.
///
/// Representations are cheap, borrow from their [`GroupSet`], and may be built and discarded
/// freely.
#[derive(Clone)]
pub struct Representation<'a> {
    set: &'a GroupSet,
    groups: Vec<GroupId>,
}

impl<'a> Representation<'a> {
    /// Builds a representation of the given groups, applying the reduction group by group. An
    /// empty iterator yields the scalar (zero-dimensional) representation.
    pub fn new<I: IntoIterator<Item = GroupId>>(set: &'a GroupSet, ids: I) -> Self {
        let mut repr = Representation {
            set,
            groups: Vec::new(),
        };
        for id in ids {
            repr.add_group(id);
        }
        repr
    }

    /// Adds one group to the representation.
    ///
    /// If a group already present is a twin of `id` (or `id` itself) or a child of `id`, then
    /// `id`'s information is already represented at equal or finer granularity and nothing
    /// changes. Otherwise `id` is inserted and every group it subsumes (its strict ancestors
    /// among those present) is removed. The reduction is confluent: any insertion order over the
    /// same groups yields a twin-equivalent result.
    pub fn add_group(&mut self, id: GroupId) {
        let set = self.set;
        if self
            .groups
            .iter()
            .any(|&held| set.are_twins(held, id) || set.is_ancestor_of(id, held))
        {
            return;
        }
        self.groups.retain(|&held| !set.is_ancestor_of(held, id));

        let name = set.name(id);
        let at = self.groups.partition_point(|&held| set.name(held) < name);
        self.groups.insert(at, id);
    }

    /// Returns the reduced union of two representations.
    ///
    /// # Panics
    ///
    /// Panics if the two representations come from different [`GroupSet`]s.
    pub fn merge(&self, other: &Representation<'_>) -> Representation<'a> {
        assert!(
            std::ptr::eq(self.set, other.set),
            "representations belong to different group sets"
        );
        let mut merged = self.clone();
        for &id in &other.groups {
            merged.add_group(id);
        }
        merged
    }

    /// The ids of the groups forming the axes, in canonical (column name) order.
    pub fn group_ids(&self) -> &[GroupId] {
        &self.groups
    }

    /// Returns an iterator over the groups forming the axes, in canonical order.
    pub fn groups(&self) -> impl Iterator<Item = &'a Group> + '_ {
        let set = self.set;
        self.groups.iter().map(move |&id| set.group(id))
    }

    /// The number of axes.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns `true` for the scalar representation.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns `true` if the given group is one of the axes.
    pub fn contains(&self, id: GroupId) -> bool {
        self.groups.contains(&id)
    }

    /// The shape of a value defined on this representation: one entry per axis, each the member
    /// count of that axis' group.
    pub fn shape(&self) -> Vec<usize> {
        self.groups
            .iter()
            .map(|&id| self.set.group(id).len())
            .collect()
    }

    fn class_key(&self) -> Vec<GroupId> {
        let mut key: Vec<GroupId> = self
            .groups
            .iter()
            .map(|&id| self.set.twin_class(id))
            .collect();
        key.sort_unstable();
        key
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }

    /// Computes, for each axis of this (source) representation, an index array of `target`'s
    /// shape, such that indexing a source-shaped value with the tuple of arrays yields a
    /// target-shaped value. [`Representation::map`] does exactly that in one step; this form
    /// exists for callers that hand the indices to another tensor engine.
    pub fn index_arrays(
        &self,
        target: &Representation<'_>,
    ) -> Result<Vec<ArrayD<usize>>, MapError> {
        let resolutions = self.resolutions(target)?;
        let shape = target.shape();
        Ok(resolutions
            .iter()
            .map(|resolution| {
                ArrayD::from_shape_fn(IxDyn(&shape), |at| resolution.source_index(&at))
            })
            .collect())
    }

    /// Translates a value shaped like this representation into `target`'s shape by pure indexing:
    /// one-to-one through twin or child links, or through an exact combination of ancestor axes.
    ///
    /// Repeating a coarse value across a finer target is always allowed; the reverse direction
    /// would need an aggregation rule and fails with [`MapError::AmbiguousBroadcast`]. A scalar
    /// (zero-axis) source broadcasts to any target.
    ///
    /// # Panics
    ///
    /// Panics if the two representations come from different [`GroupSet`]s.
    pub fn map<A: Clone>(
        &self,
        value: &ArrayD<A>,
        target: &Representation<'_>,
    ) -> Result<ArrayD<A>, MapError> {
        let expected = self.shape();
        if value.shape() != expected.as_slice() {
            return Err(MapError::ShapeMismatch {
                expected,
                actual: value.shape().to_vec(),
            });
        }

        let resolutions = self.resolutions(target)?;
        let shape = target.shape();
        let mut source = Vec::with_capacity(resolutions.len());
        Ok(ArrayD::from_shape_fn(IxDyn(&shape), |at| {
            source.clear();
            source.extend(resolutions.iter().map(|r| r.source_index(&at)));
            value[IxDyn(&source)].clone()
        }))
    }

    fn resolutions(
        &self,
        target: &Representation<'_>,
    ) -> Result<Vec<AxisResolution<'a>>, MapError> {
        assert!(
            std::ptr::eq(self.set, target.set),
            "representations belong to different group sets"
        );
        self.groups
            .iter()
            .map(|&id| self.resolve_axis(id, target))
            .collect()
    }

    /// Finds how one source axis is read from the target's coordinate space.
    fn resolve_axis(
        &self,
        source: GroupId,
        target: &Representation<'_>,
    ) -> Result<AxisResolution<'a>, MapError> {
        let set = self.set;

        // One-to-one, same information: the group itself or a twin relabeling.
        for (axis, &held) in target.groups.iter().enumerate() {
            if held == source {
                return Ok(AxisResolution::Same { axis });
            }
            if set.are_twins(held, source) {
                let link = set.group(held).link(source).unwrap();
                return Ok(AxisResolution::Link { axis, link });
            }
        }

        // One-to-one, finer target: a child axis repeats the source value, each child member
        // reading through its stored parent-member index.
        for (axis, &held) in target.groups.iter().enumerate() {
            if set.is_ancestor_of(source, held) {
                let link = set.group(held).link(source).unwrap();
                return Ok(AxisResolution::Link { axis, link });
            }
        }

        // One-to-combination: several ancestor axes may jointly identify the source member, if
        // their member product covers it exactly. Smallest subsets first.
        let candidates: Vec<usize> = target
            .groups
            .iter()
            .enumerate()
            .filter(|&(_, &held)| set.is_ancestor_of(held, source))
            .map(|(axis, _)| axis)
            .collect();
        let group = set.group(source);

        if !candidates.is_empty() {
            assert!(candidates.len() < 32, "too many candidate ancestor axes");
            let mut masks: Vec<u32> = (1..(1u32 << candidates.len())).collect();
            masks.sort_unstable_by_key(|mask| (mask.count_ones(), *mask));

            'masks: for mask in masks {
                let axes: Vec<usize> = candidates
                    .iter()
                    .enumerate()
                    .filter(|&(bit, _)| mask & (1 << bit) != 0)
                    .map(|(_, &axis)| axis)
                    .collect();

                let mut product = 1usize;
                for &axis in &axes {
                    product = match product.checked_mul(set.group(target.groups[axis]).len()) {
                        Some(product) => product,
                        None => continue 'masks,
                    };
                }
                if product != group.len() {
                    continue;
                }

                // Row-major strides over the chosen target axes.
                let mut strides = vec![1usize; axes.len()];
                for at in (0..axes.len().saturating_sub(1)).rev() {
                    strides[at] = strides[at + 1] * set.group(target.groups[axes[at + 1]]).len();
                }

                let mut inverse = vec![u32::MAX; product];
                for member in 0..group.len() {
                    let mut slot = 0;
                    for (at, &axis) in axes.iter().enumerate() {
                        let link = group.link(target.groups[axis]).unwrap();
                        slot += link[member] as usize * strides[at];
                    }
                    if inverse[slot] != u32::MAX {
                        // Two members share the same ancestor tuple: not invertible.
                        continue 'masks;
                    }
                    inverse[slot] = member as u32;
                }
                return Ok(AxisResolution::Product {
                    axes,
                    strides,
                    inverse,
                });
            }

            // Even all ancestor axes combined cannot hold this group's members: the caller is
            // coarsening, which would silently need an aggregation rule.
            let capacity = candidates.iter().fold(1usize, |capacity, &axis| {
                capacity.saturating_mul(set.group(target.groups[axis]).len())
            });
            if capacity < group.len() {
                return Err(MapError::AmbiguousBroadcast {
                    group: set.name(source).to_owned(),
                    target: target.describe(),
                });
            }
        }

        Err(MapError::Unreachable {
            group: set.name(source).to_owned(),
            target: target.describe(),
        })
    }
}

impl PartialEq for Representation<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.set, other.set) && self.class_key() == other.class_key()
    }
}

impl Eq for Representation<'_> {}

impl std::hash::Hash for Representation<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.class_key().hash(state);
    }
}

impl fmt::Debug for Representation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (at, &id) in self.groups.iter().enumerate() {
            if at > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", self.set.name(id))?;
        }
        write!(f, "}}")
    }
}

/// How one source axis is read from the target's coordinate space.
enum AxisResolution<'a> {
    /// The target carries the source group itself at this axis.
    Same { axis: usize },
    /// A twin or child group at this axis, read through its member link array.
    Link { axis: usize, link: &'a [u32] },
    /// Several ancestor axes jointly identify the source member through an inverted composite
    /// key.
    Product {
        axes: Vec<usize>,
        strides: Vec<usize>,
        inverse: Vec<u32>,
    },
}

impl AxisResolution<'_> {
    fn source_index(&self, at: &IxDyn) -> usize {
        match self {
            AxisResolution::Same { axis } => at[*axis],
            AxisResolution::Link { axis, link } => link[at[*axis]] as usize,
            AxisResolution::Product {
                axes,
                strides,
                inverse,
            } => {
                let mut slot = 0;
                for (k, &axis) in axes.iter().enumerate() {
                    slot += at[axis] * strides[k];
                }
                inverse[slot] as usize
            }
        }
    }
}
