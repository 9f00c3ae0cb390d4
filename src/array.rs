//! The merge-map-array operator and its source container: a time-varying array of items projected
//! into a time-varying array of derived values, with one independently cancellable [`Signal`] per
//! logical array element, see [`ArraySignalExt::merge_map_array`] and [`MutableArray`].

use super::{
    graph::{
        LazySignal, SignalHandle, SignalHandles, SignalSystem, pipe_signal, process_signals, register_signal,
    },
    signal::{Signal, SignalBuilder, SignalExt, Source},
    utils::{LazyEntity, SSs},
};
use crate::prelude::clone;
use bevy_ecs::{change_detection::Mut, entity_disabling::Internal, prelude::*};
use bevy_log::prelude::*;
use bevy_platform::{
    prelude::*,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    },
};
use core::{marker::PhantomData, ops::Deref};

/// Caller-supplied equality relation defining what "the same logical item" means across input
/// snapshots.
///
/// The relation is an arbitrary predicate, so items are never used as hash keys; every match the
/// operator performs is a first-match-wins linear scan with this function.
pub type ItemEquality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Deduplicates `items` under `is_equal`, preserving first-occurrence order. Returns the input
/// unchanged when no duplicates were found.
fn unique_by<T: Clone>(items: Vec<T>, is_equal: &dyn Fn(&T, &T) -> bool) -> Vec<T> {
    let mut deduped: Vec<T> = Vec::new();
    let mut has_duplicates = false;
    for item in &items {
        if deduped.iter().any(|previous| is_equal(previous, item)) {
            has_duplicates = true;
        } else {
            deduped.push(item.clone());
        }
    }
    if has_duplicates { deduped } else { items }
}

/// Computes the deduplicated sets of logical items that appeared in and disappeared from `next`
/// relative to `current`. Duplicate count and order changes are not membership changes, so a
/// snapshot that merely reorders or repeats existing items produces two empty sets.
fn diff_snapshots<T: Clone>(
    current: &[T],
    next: &[T],
    is_equal: &dyn Fn(&T, &T) -> bool,
) -> (Vec<T>, Vec<T>) {
    let added = next
        .iter()
        .filter(|item| !current.iter().any(|existing| is_equal(existing, item)))
        .cloned()
        .collect();
    let removed = current
        .iter()
        .filter(|item| !next.iter().any(|incoming| is_equal(incoming, item)))
        .cloned()
        .collect();
    (unique_by(added, is_equal), unique_by(removed, is_equal))
}

/// A filled assembly position; presence implies the position's projection has emitted since it was
/// last (re)started.
struct Assembled<T, R> {
    item: T,
    value: R,
}

impl<T: Clone, R: Clone> Clone for Assembled<T, R> {
    fn clone(&self) -> Self {
        Self {
            item: self.item.clone(),
            value: self.value.clone(),
        }
    }
}

/// Event funneled from a per-item projection into the assembler.
enum ItemEvent<T, R> {
    Emit { element: T, value: R },
    Remove { element: T },
}

/// Rebuilds the assembly against the current `snapshot`'s positions, in order: positions equal to
/// the event's element take the new value (`Emit`) or are dropped entirely (`Remove`); every other
/// position carries the previous assembly's entry found by equality lookup, or stays pending.
fn reconcile<T: Clone, R: Clone>(
    snapshot: &[T],
    previous: &[Option<Assembled<T, R>>],
    event: &ItemEvent<T, R>,
    is_equal: &dyn Fn(&T, &T) -> bool,
) -> Vec<Option<Assembled<T, R>>> {
    let (element, emitted) = match event {
        ItemEvent::Emit { element, value } => (element, Some(value)),
        ItemEvent::Remove { element } => (element, None),
    };
    let mut next = Vec::with_capacity(snapshot.len());
    for item in snapshot {
        if is_equal(item, element) {
            // a removed position is dropped from the assembly entirely; re-adding an equal item
            // later restarts it pending
            if let Some(value) = emitted {
                next.push(Some(Assembled {
                    item: item.clone(),
                    value: value.clone(),
                }));
            }
        } else {
            next.push(
                previous
                    .iter()
                    .flatten()
                    .find(|entry| is_equal(&entry.item, item))
                    .cloned(),
            );
        }
    }
    next
}

/// Extracts the output array, in assembly order, once every position is filled.
fn completed_values<T, R: Clone>(assembly: &[Option<Assembled<T, R>>]) -> Option<Vec<R>> {
    assembly
        .iter()
        .map(|entry| entry.as_ref().map(|assembled| assembled.value.clone()))
        .collect()
}

/// One live per-item projection registration, owned for a single add-to-remove span.
struct Processor<T> {
    item: T,
    handle: SignalHandle,
}

static ORPHANED_PROCESSORS: LazyLock<Mutex<Vec<SignalSystem>>> = LazyLock::new(Mutex::default);

/// State of one [`MergeMapArray`] activation, held on its output node.
#[derive(Component)]
struct ManagerState<T: SSs, R: SSs> {
    current: Vec<T>,
    assembly: Vec<Option<Assembled<T, R>>>,
    processors: Vec<Processor<T>>,
}

impl<T: SSs, R: SSs> Drop for ManagerState<T, R> {
    fn drop(&mut self) {
        // operator teardown; still-live projections are cancelled by the next flush
        let mut orphaned = ORPHANED_PROCESSORS.lock().unwrap();
        orphaned.extend(self.processors.drain(..).map(|processor| *processor.handle));
    }
}

pub(crate) fn flush_orphaned_processors(world: &mut World) {
    let orphaned = ORPHANED_PROCESSORS.lock().unwrap().drain(..).collect::<Vec<_>>();
    for signal in orphaned {
        SignalHandle::new(signal).cleanup(world);
    }
}

/// Output arrays awaiting delivery, drained by the output node's runner.
#[derive(Component)]
struct QueuedOutputs<R>(Vec<Vec<R>>);

fn apply_item_event<T, R>(
    world: &mut World,
    output_signal: SignalSystem,
    event: ItemEvent<T, R>,
    is_equal: &ItemEquality<T>,
) where
    T: Clone + SSs,
    R: Clone + SSs,
{
    let completed = {
        let Some(mut state) = world.get_mut::<ManagerState<T, R>>(*output_signal) else {
            return;
        };
        let next = reconcile(&state.current, &state.assembly, &event, &**is_equal);
        let completed = completed_values(&next);
        state.assembly = next;
        completed
    };
    if let Some(values) = completed
        && let Some(mut queue) = world.get_mut::<QueuedOutputs<R>>(*output_signal)
    {
        queue.0.push(values);
        process_signals(world, [output_signal], Box::new(()));
    }
}

/// Signal graph node projecting each logical item of an upstream array signal through its own
/// [`Signal`], see [`.merge_map_array`](ArraySignalExt::merge_map_array).
pub struct MergeMapArray<Upstream, S: Signal> {
    signal: LazySignal,
    _marker: PhantomData<fn() -> (Upstream, S)>,
}

impl<Upstream, S: Signal> Clone for MergeMapArray<Upstream, S> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Upstream, T, S> Signal for MergeMapArray<Upstream, S>
where
    Upstream: Signal<Item = Vec<T>>,
    T: Clone + SSs,
    S: Signal + 'static,
    S::Item: Clone + SSs,
{
    type Item = Vec<S::Item>;

    fn register_boxed_signal(self: Box<Self>, world: &mut World) -> SignalHandle {
        self.signal.register(world).into()
    }
}

/// Extension trait providing the merge-map-array operator for [`Signal`]s of [`Vec`]s.
pub trait ArraySignalExt<T>: Signal<Item = Vec<T>>
where
    T: Clone + SSs,
{
    /// Projects each logical item of this array [`Signal`] through its own [`Signal`], outputting
    /// the latest projected value of every item currently present, in the input array's current
    /// order.
    ///
    /// One projection is started per logical item when the item first appears and is cancelled,
    /// synchronously, when a matching item no longer appears; re-adding an equal item later starts
    /// an entirely new projection. Duplicate equal items each occupy their own output position but
    /// share a single projection. Reordering the input reorders the output identically without
    /// restarting anything. An output array is only emitted once every present item has emitted at
    /// least one value since it was last (re)started, so a projection that never outputs keeps the
    /// output gated; an empty input array is forwarded directly as an empty output array.
    ///
    /// Logical items are identified by [`PartialEq`]; use
    /// [`.merge_map_array_by`](ArraySignalExt::merge_map_array_by) to supply an arbitrary equality
    /// relation.
    ///
    /// # Example
    /// ```no_run
    /// # use bevy::prelude::*;
    /// # use shoal::prelude::*;
    /// # let mut world = World::new();
    /// MutableArray::with_items(&mut world, [1, 2, 3])
    ///     .signal()
    ///     .merge_map_array(|In(x): In<i32>| {
    ///         SignalBuilder::from_system(move |_: In<()>| x * 2).dedupe()
    ///     }); // outputs `[2, 4, 6]`
    /// ```
    fn merge_map_array<S, F, M>(self, project: F) -> MergeMapArray<Self, S>
    where
        Self: Sized,
        T: PartialEq,
        S: Signal + 'static,
        S::Item: Clone + SSs,
        F: IntoSystem<In<T>, S, M> + SSs,
    {
        self.merge_map_array_by(project, T::eq)
    }

    /// [`.merge_map_array`](ArraySignalExt::merge_map_array) with a caller-supplied equality
    /// relation identifying logical items across snapshots. Items whose payload changes without
    /// changing their identity under `is_equal` neither restart their projection nor produce any
    /// diff activity.
    fn merge_map_array_by<S, F, M, E>(self, project: F, is_equal: E) -> MergeMapArray<Self, S>
    where
        Self: Sized,
        S: Signal + 'static,
        S::Item: Clone + SSs,
        F: IntoSystem<In<T>, S, M> + SSs,
        E: Fn(&T, &T) -> bool + SSs,
    {
        let is_equal: ItemEquality<T> = Arc::new(is_equal);
        let signal = LazySignal::new(move |world: &mut World| {
            let factory_system_id = world.register_system(project);
            let output_entity = LazyEntity::new();
            let output_signal = *SignalBuilder::from_system::<Vec<S::Item>, _, _, _>(clone!(
                (output_entity) move |_: In<()>, world: &mut World| {
                    if let Some(mut queue) = world.get_mut::<QueuedOutputs<S::Item>>(output_entity.get()) {
                        if queue.0.is_empty() {
                            None
                        } else {
                            Some(queue.0.remove(0))
                        }
                    } else {
                        None
                    }
                }
            ))
            .register(world);
            output_entity.set(*output_signal);

            let manager_logic = clone!((is_equal) move |In(snapshot): In<Vec<T>>, world: &mut World| {
                // the output node owns the state; if it's mid-teardown there's nothing to manage
                let Some(mut state) = world.get_mut::<ManagerState<T, S::Item>>(*output_signal) else {
                    return;
                };
                let previous = core::mem::replace(&mut state.current, snapshot.clone());
                let (added, removed) = diff_snapshots(&previous, &snapshot, &*is_equal);

                // An empty array has no positions, so it can never organically produce an
                // added/removed event for itself; forward it directly.
                if snapshot.is_empty() {
                    if let Some(mut queue) = world.get_mut::<QueuedOutputs<S::Item>>(*output_signal) {
                        queue.0.push(Vec::new());
                    }
                    process_signals(world, [output_signal], Box::new(()));
                }

                for element in removed {
                    // cancellation wins the race: the projection is torn down before its removal
                    // event reaches the assembler, so no further values from it are accepted
                    let processor = world
                        .get_mut::<ManagerState<T, S::Item>>(*output_signal)
                        .and_then(|mut state| {
                            state
                                .processors
                                .iter()
                                .position(|processor| is_equal(&processor.item, &element))
                                .map(|index| state.processors.remove(index))
                        });
                    if let Some(processor) = processor {
                        processor.handle.cleanup(world);
                    }
                    apply_item_event::<T, S::Item>(world, output_signal, ItemEvent::Remove { element }, &is_equal);
                }

                for element in added {
                    match world.run_system_with(factory_system_id, element.clone()) {
                        Ok(projection) => {
                            let processor_logic = clone!((is_equal, element)
                                move |In(value): In<S::Item>, world: &mut World| {
                                    apply_item_event(
                                        world,
                                        output_signal,
                                        ItemEvent::Emit { element: element.clone(), value },
                                        &is_equal,
                                    );
                                }
                            );
                            let handle = projection.map(processor_logic).register(world);
                            if let Some(mut state) = world.get_mut::<ManagerState<T, S::Item>>(*output_signal) {
                                state.processors.push(Processor { item: element, handle });
                            } else {
                                handle.cleanup(world);
                            }
                        }
                        Err(error) => {
                            error!("merge_map_array failed to run its projection factory: {:?}", error);
                        }
                    }
                }
            });
            let manager_handle = self.map(manager_logic).register(world);
            world
                .entity_mut(*output_signal)
                .insert((
                    ManagerState::<T, S::Item> {
                        current: Vec::new(),
                        assembly: Vec::new(),
                        processors: Vec::new(),
                    },
                    QueuedOutputs::<S::Item>(Vec::new()),
                ))
                .add_child(factory_system_id.entity())
                .insert(SignalHandles::from([manager_handle]));

            output_signal
        });
        MergeMapArray {
            signal,
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + SSs, S: Signal<Item = Vec<T>>> ArraySignalExt<T> for S {}

static STALE_MUTABLE_ARRAYS: LazyLock<Mutex<Vec<Entity>>> = LazyLock::new(Mutex::default);

/// [`Component`] that holds the actual state for a [`MutableArray`].
#[derive(Component)]
pub struct MutableArrayData<T: SSs> {
    items: Vec<T>,
    dirty: bool,
    broadcaster: LazySignal,
}

/// Wrapper around a [`Vec`] whose mutations are flushed as whole-array snapshots, providing the
/// input side of [`ArraySignalExt::merge_map_array`]; change detection between snapshots belongs to
/// the operator, not the container.
pub struct MutableArray<T: SSs> {
    entity: Entity,
    references: Arc<AtomicUsize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SSs> Clone for MutableArray<T> {
    fn clone(&self) -> Self {
        self.references.fetch_add(1, AtomicOrdering::SeqCst);
        Self {
            entity: self.entity,
            references: self.references.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: SSs> Drop for MutableArray<T> {
    fn drop(&mut self) {
        if self.references.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            STALE_MUTABLE_ARRAYS.lock().unwrap().push(self.entity);
        }
    }
}

fn new_mutable_array_data<T>(items: Vec<T>) -> (MutableArrayData<T>, LazyEntity)
where
    T: Clone + SSs,
{
    let data_entity = LazyEntity::new();
    let broadcaster = LazySignal::new(clone!((data_entity) move |world: &mut World| {
        let source_system = move |_: In<()>, mut datas: Query<&mut MutableArrayData<T>>| {
            let mut data = datas.get_mut(*data_entity).unwrap();
            if data.dirty {
                data.dirty = false;
                Some(data.items.clone())
            } else {
                None
            }
        };
        register_signal::<(), Vec<T>, _, _, _>(world, source_system)
    }));
    (
        MutableArrayData {
            items,
            dirty: false,
            broadcaster,
        },
        data_entity,
    )
}

impl<T: Clone + SSs> MutableArray<T> {
    /// Spawns an empty [`MutableArray`].
    pub fn new(world: &mut World) -> Self {
        Self::with_items(world, Vec::new())
    }

    /// Spawns a [`MutableArray`] with initial `items`.
    pub fn with_items<A>(world: &mut World, items: A) -> Self
    where
        Vec<T>: From<A>,
    {
        let (data, data_entity) = new_mutable_array_data::<T>(items.into());
        let entity = world.spawn(data).id();
        data_entity.set(entity);
        Self {
            entity,
            references: Arc::new(AtomicUsize::new(1)),
            _marker: PhantomData,
        }
    }

    /// Provides read-only access to the underlying array.
    pub fn read<'w>(&self, world: &'w World) -> &'w [T] {
        &world.get::<MutableArrayData<T>>(self.entity).unwrap().items
    }

    /// Provides write access to the underlying array; mutations are flushed downstream as a single
    /// fresh snapshot during the next [`Last`](bevy_app::Last) run.
    pub fn write<'w>(&self, world: &'w mut World) -> MutableArrayWriteGuard<'w, T> {
        MutableArrayWriteGuard {
            data: world.get_mut::<MutableArrayData<T>>(self.entity).unwrap(),
        }
    }

    /// Returns a [`Source`] signal of this [`MutableArray`]'s snapshots. On registration the
    /// current snapshot is replayed once, including an empty one, so a subscriber of an empty
    /// array still observes it.
    pub fn signal(&self) -> Source<Vec<T>> {
        let data_entity = self.entity;
        let replay_lazy_signal = LazySignal::new(clone!((self => self_) move |world: &mut World| {
            let broadcaster = world
                .get::<MutableArrayData<T>>(self_.entity)
                .unwrap()
                .broadcaster
                .clone()
                .register(world);

            let replay_entity = LazyEntity::new();
            let replay_system = clone!((replay_entity) move |In(snapshot): In<Vec<T>>,
                replay_onces: Query<&ReplayOnce, Allow<Internal>>,
                datas: Query<&MutableArrayData<T>>| {
                if replay_onces.contains(*replay_entity) {
                    Some(datas.get(data_entity).unwrap().items.clone())
                } else {
                    Some(snapshot)
                }
            });
            let replay_signal = register_signal::<_, Vec<T>, _, _, _>(world, replay_system);
            replay_entity.set(*replay_signal);

            let trigger = Box::new(move |world: &mut World| {
                process_signals(world, [replay_signal], Box::new(Vec::<T>::new()));
            });
            world
                .entity_mut(*replay_signal)
                .insert((ArrayReplayTrigger(trigger), ReplayOnce));

            pipe_signal(world, broadcaster, replay_signal);
            replay_signal
        }));

        Source {
            signal: replay_lazy_signal,
            _marker: PhantomData,
        }
    }
}

/// Write access to a [`MutableArray`], see [`MutableArray::write`].
pub struct MutableArrayWriteGuard<'w, T: SSs> {
    data: Mut<'w, MutableArrayData<T>>,
}

impl<T: SSs> Deref for MutableArrayWriteGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.data.items
    }
}

impl<T: SSs> MutableArrayWriteGuard<'_, T> {
    /// Appends an item to the back of this [`MutableArray`].
    pub fn push(&mut self, item: T) {
        self.data.items.push(item);
        self.data.dirty = true;
    }

    /// Inserts an item at `index`, shifting all items after it to the right.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&mut self, index: usize, item: T) {
        self.data.items.insert(index, item);
        self.data.dirty = true;
    }

    /// Removes and returns the item at `index`, shifting all items after it to the left.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> T {
        let item = self.data.items.remove(index);
        self.data.dirty = true;
        item
    }

    /// Replaces the item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, item: T) {
        self.data.items[index] = item;
        self.data.dirty = true;
    }

    /// Moves the item at `old_index` to `new_index`.
    ///
    /// # Panics
    ///
    /// Panics if `old_index` or `new_index` are out of bounds.
    pub fn move_item(&mut self, old_index: usize, new_index: usize) {
        if old_index != new_index {
            let item = self.data.items.remove(old_index);
            self.data.items.insert(new_index, item);
            self.data.dirty = true;
        }
    }

    /// Clears this [`MutableArray`].
    pub fn clear(&mut self) {
        if !self.data.items.is_empty() {
            self.data.items.clear();
            self.data.dirty = true;
        }
    }

    /// Replaces the entire contents of this [`MutableArray`] with `items`.
    pub fn replace<A>(&mut self, items: A)
    where
        Vec<T>: From<A>,
    {
        self.data.items = items.into();
        self.data.dirty = true;
    }
}

#[derive(Component)]
pub(crate) struct ArrayReplayTrigger(Box<dyn Fn(&mut World) + Send + Sync>);

#[derive(Component)]
pub(crate) struct ReplayOnce;

pub(crate) fn flush_array_replays(world: &mut World) {
    let pending: Vec<Entity> = world
        .query_filtered::<Entity, (With<ReplayOnce>, Allow<Internal>)>()
        .iter(world)
        .collect();
    for entity in pending {
        if let Some(trigger) = world
            .get_entity_mut(entity)
            .ok()
            .and_then(|mut entity| entity.take::<ArrayReplayTrigger>())
        {
            trigger.0(world);
            let mut entity = world.entity_mut(entity);
            entity.remove::<ReplayOnce>();
            entity.insert(trigger);
        }
    }
}

pub(crate) fn despawn_stale_mutable_arrays(world: &mut World) {
    let stale = STALE_MUTABLE_ARRAYS.lock().unwrap().drain(..).collect::<Vec<_>>();
    for entity in stale {
        world.despawn(entity);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ShoalPlugin;
    use bevy::prelude::*;
    use test_log::test;

    #[derive(Resource, Default, Debug)]
    struct Outputs<R: SSs + Clone + core::fmt::Debug>(Vec<Vec<R>>);

    // Helper system to capture the operator's output arrays in emission order
    fn capture_outputs<R>(In(values): In<Vec<R>>, mut outputs: ResMut<Outputs<R>>)
    where
        R: SSs + Clone + core::fmt::Debug,
    {
        debug!("capture outputs: received {:?}", values);
        outputs.0.push(values);
    }

    fn get_and_clear_outputs<R: SSs + Clone + core::fmt::Debug>(world: &mut World) -> Vec<Vec<R>> {
        let outputs = world.resource::<Outputs<R>>().0.clone();
        world.resource_mut::<Outputs<R>>().0.clear();
        outputs
    }

    pub(crate) fn cleanup() {
        STALE_MUTABLE_ARRAYS.lock().unwrap().clear();
        ORPHANED_PROCESSORS.lock().unwrap().clear();
    }

    fn create_test_app() -> App {
        cleanup();
        let mut app = App::new();
        app.add_plugins((MinimalPlugins, ShoalPlugin));
        app
    }

    #[derive(Resource, Default, Debug)]
    struct Spawns(usize);

    #[derive(Resource, Clone, Debug, PartialEq)]
    struct Phase(u32);

    // projection whose output changes whenever the `Phase` resource does
    fn phased(id: i32) -> impl SignalExt<Item = String> {
        SignalBuilder::from_resource::<Phase>()
            .map_in(move |Phase(phase)| format!("{id}@{phase}"))
            .dedupe()
    }

    #[test]
    fn unique_by_preserves_first_occurrence() {
        let eq = |a: &i32, b: &i32| a == b;
        assert_eq!(unique_by(vec![1, 2, 1, 3, 2], &eq), vec![1, 2, 3]);
        assert_eq!(unique_by(vec![1, 2, 3], &eq), vec![1, 2, 3]);
        assert_eq!(unique_by(Vec::<i32>::new(), &eq), Vec::<i32>::new());
    }

    #[test]
    fn diff_tracks_membership_not_positions() {
        let eq = |a: &i32, b: &i32| a == b;

        let (added, removed) = diff_snapshots(&[1, 2, 3], &[3, 2, 1], &eq);
        assert!(added.is_empty() && removed.is_empty(), "pure reorder is not a membership change");

        let (added, removed) = diff_snapshots(&[1, 2], &[2, 2, 1, 1], &eq);
        assert!(added.is_empty() && removed.is_empty(), "duplicate count is not a membership change");

        let (added, removed) = diff_snapshots(&[1, 2, 3], &[2, 4, 4], &eq);
        assert_eq!(added, vec![4]);
        assert_eq!(removed, vec![1, 3]);
    }

    fn assembled(item: i32, value: &str) -> Option<Assembled<i32, String>> {
        Some(Assembled {
            item,
            value: value.to_string(),
        })
    }

    #[test]
    fn reconcile_carries_values_across_reordering() {
        let eq = |a: &i32, b: &i32| a == b;
        let previous = vec![assembled(1, "one"), assembled(2, "two")];
        let event = ItemEvent::Emit {
            element: 2,
            value: "TWO".to_string(),
        };
        let next = reconcile(&[2, 1], &previous, &event, &eq);
        assert_eq!(completed_values(&next), Some(vec!["TWO".to_string(), "one".to_string()]));
    }

    #[test]
    fn reconcile_drops_removed_position_and_leaves_new_items_pending() {
        let eq = |a: &i32, b: &i32| a == b;
        let previous = vec![assembled(1, "one"), assembled(2, "two")];

        let event = ItemEvent::Remove { element: 1 };
        let next = reconcile(&[2], &previous, &event, &eq);
        assert_eq!(completed_values(&next), Some(vec!["two".to_string()]));

        let event = ItemEvent::Emit {
            element: 2,
            value: "two".to_string(),
        };
        let next = reconcile(&[2, 3], &previous, &event, &eq);
        assert_eq!(completed_values(&next), None, "a position without an emission gates the output");
    }

    #[test]
    fn single_item_projects_synchronously() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        let array = MutableArray::with_items(app.world_mut(), [1]);
        let handle = array
            .signal()
            .merge_map_array(|In(x): In<i32>| {
                SignalBuilder::from_system(move |_: In<()>| format!("id={x}")).dedupe()
            })
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["id=1".to_string()]]
        );

        // quiescent input, quiescent output
        app.update();
        assert!(get_and_clear_outputs::<String>(app.world_mut()).is_empty());
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn empty_input_forwards_empty_output() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        let array = MutableArray::<i32>::new(app.world_mut());
        let handle = array
            .signal()
            .merge_map_array(|In(x): In<i32>| {
                SignalBuilder::from_system(move |_: In<()>| format!("id={x}")).dedupe()
            })
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![Vec::<String>::new()],
            "an empty array is forwarded without waiting on any projection"
        );

        array.write(app.world_mut()).push(5);
        assert_eq!(array.read(app.world()), &[5]);
        app.update(); // projection spawned
        app.update(); // and emits
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["id=5".to_string()]]
        );

        array.write(app.world_mut()).clear();
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![Vec::<String>::new(), Vec::<String>::new()],
            "clearing forwards the empty array and the removal also settles to empty"
        );
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn reordering_preserves_in_flight_values() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.init_resource::<Spawns>();
        app.insert_resource(Phase(0));
        let array = MutableArray::with_items(app.world_mut(), [1, 2, 3]);
        let handle = array
            .signal()
            .merge_map_array(|In(id): In<i32>, mut spawns: ResMut<Spawns>| {
                spawns.0 += 1;
                phased(id)
            })
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@0".to_string(), "2@0".to_string(), "3@0".to_string()]]
        );
        assert_eq!(app.world().resource::<Spawns>().0, 3);

        array.write(app.world_mut()).replace([3, 2, 1]);
        app.update();
        assert!(
            get_and_clear_outputs::<String>(app.world_mut()).is_empty(),
            "a pure reorder produces no item events and so nothing to emit"
        );
        assert_eq!(app.world().resource::<Spawns>().0, 3, "reordering must not restart projections");

        // the next per item event reveals the new order, other positions carry forward
        app.insert_resource(Phase(1));
        app.update();
        let outputs = get_and_clear_outputs::<String>(app.world_mut());
        assert_eq!(outputs.len(), 3);
        assert_eq!(
            outputs.last().unwrap(),
            &["3@1".to_string(), "2@1".to_string(), "1@1".to_string()]
        );
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn removal_shrinks_output_without_waiting() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.insert_resource(Phase(0));
        let array = MutableArray::with_items(app.world_mut(), [1, 2]);
        let handle = array
            .signal()
            .merge_map_array(|In(id): In<i32>| phased(id))
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@0".to_string(), "2@0".to_string()]]
        );

        array.write(app.world_mut()).remove(1);
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@0".to_string()]],
            "removal emits the shrunk array immediately, all survivors are already filled"
        );
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn removed_projection_cannot_emit_after_cleanup() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.insert_resource(Phase(0));
        let array = MutableArray::with_items(app.world_mut(), [1, 2]);
        let handle = array
            .signal()
            .merge_map_array(|In(id): In<i32>| phased(id))
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        get_and_clear_outputs::<String>(app.world_mut());

        array.write(app.world_mut()).remove(1);
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@0".to_string()]]
        );

        // item 2's projection was torn down with its removal, so its later values are gone
        app.insert_resource(Phase(1));
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@1".to_string()]]
        );
        app.update();
        assert!(get_and_clear_outputs::<String>(app.world_mut()).is_empty());
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn duplicates_share_one_projection() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.init_resource::<Spawns>();
        app.insert_resource(Phase(0));
        let array = MutableArray::with_items(app.world_mut(), [1, 2, 1]);
        let handle = array
            .signal()
            .merge_map_array(|In(id): In<i32>, mut spawns: ResMut<Spawns>| {
                spawns.0 += 1;
                phased(id)
            })
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@0".to_string(), "2@0".to_string(), "1@0".to_string()]]
        );
        assert_eq!(app.world().resource::<Spawns>().0, 2, "equal items share one projection");

        array.write(app.world_mut()).insert(3, 2);
        app.update();
        assert!(
            get_and_clear_outputs::<String>(app.world_mut()).is_empty(),
            "a duplicate count change produces no item events"
        );
        assert_eq!(app.world().resource::<Spawns>().0, 2);

        app.insert_resource(Phase(1));
        app.update();
        let outputs = get_and_clear_outputs::<String>(app.world_mut());
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs.last().unwrap(),
            &["1@1".to_string(), "2@1".to_string(), "1@1".to_string(), "2@1".to_string()]
        );
        handle.cleanup(app.world_mut());
    }

    #[derive(Clone, Debug)]
    struct Row {
        id: u32,
        revision: u32,
    }

    #[test]
    fn payload_update_does_not_restart_projection() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.init_resource::<Spawns>();
        let array = MutableArray::with_items(app.world_mut(), [Row { id: 1, revision: 0 }]);
        let handle = array
            .signal()
            .merge_map_array_by(
                |In(row): In<Row>, mut spawns: ResMut<Spawns>| {
                    spawns.0 += 1;
                    let id = row.id;
                    SignalBuilder::from_system(move |_: In<()>| format!("row {id}")).dedupe()
                },
                |a: &Row, b: &Row| a.id == b.id,
            )
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["row 1".to_string()]]
        );
        assert_eq!(app.world().resource::<Spawns>().0, 1);

        array.write(app.world_mut()).set(0, Row { id: 1, revision: 9 });
        app.update();
        assert!(
            get_and_clear_outputs::<String>(app.world_mut()).is_empty(),
            "an identity preserving payload change is invisible to the operator"
        );
        assert_eq!(app.world().resource::<Spawns>().0, 1);
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn re_added_item_restarts_fresh() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.init_resource::<Spawns>();
        let array = MutableArray::with_items(app.world_mut(), [7]);
        let handle = array
            .signal()
            .merge_map_array(|In(x): In<i32>, mut spawns: ResMut<Spawns>| {
                spawns.0 += 1;
                let generation = spawns.0;
                SignalBuilder::from_system(move |_: In<()>| format!("{x}#{generation}")).dedupe()
            })
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["7#1".to_string()]]
        );

        array.write(app.world_mut()).clear();
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![Vec::<String>::new(), Vec::<String>::new()]
        );

        array.write(app.world_mut()).push(7);
        app.update();
        assert!(get_and_clear_outputs::<String>(app.world_mut()).is_empty());
        assert_eq!(app.world().resource::<Spawns>().0, 2, "re-adding starts an entirely new projection");
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["7#2".to_string()]]
        );
        handle.cleanup(app.world_mut());
    }

    #[test]
    fn cleanup_cancels_live_projections() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        app.insert_resource(Phase(0));
        let array = MutableArray::with_items(app.world_mut(), [1, 2]);
        let handle = array
            .signal()
            .merge_map_array(|In(id): In<i32>| phased(id))
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["1@0".to_string(), "2@0".to_string()]]
        );

        handle.cleanup(app.world_mut());
        app.insert_resource(Phase(1));
        array.write(app.world_mut()).push(3);
        app.update();
        app.update();
        assert!(
            get_and_clear_outputs::<String>(app.world_mut()).is_empty(),
            "a cleaned up operator neither projects nor emits"
        );
    }

    #[test]
    fn never_emitting_projection_gates_output() {
        let mut app = create_test_app();
        app.init_resource::<Outputs<String>>();
        let array = MutableArray::with_items(app.world_mut(), [1, 2]);
        let handle = array
            .signal()
            .merge_map_array(|In(id): In<i32>| {
                SignalBuilder::from_system(move |_: In<()>| format!("id={id}"))
                    .dedupe()
                    .filter(move |In(_): In<String>| id != 2)
            })
            .map(capture_outputs::<String>)
            .register(app.world_mut());

        app.update();
        app.update();
        app.update();
        assert!(
            get_and_clear_outputs::<String>(app.world_mut()).is_empty(),
            "a single silent position gates the whole output"
        );

        array.write(app.world_mut()).remove(1);
        app.update();
        assert_eq!(
            get_and_clear_outputs::<String>(app.world_mut()),
            vec![vec!["id=1".to_string()]],
            "removing the silent item frees the already filled positions"
        );
        handle.cleanup(app.world_mut());
    }
}
