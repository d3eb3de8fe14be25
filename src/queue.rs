//! The scheduling queue: one block of tasks per beat.

use crate::beat::Beat;
use crate::clock::Tempo;
use crate::engine::Engine;
use crate::event::Value;
use crate::key::VoiceId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Something to do at a beat.
pub enum Task {
    /// Play a voice's next event. Ignored if the voice's generation moved on.
    Fire { voice: VoiceId, generation: u64 },
    /// Run one of a voice's periodic calls.
    Method {
        voice: VoiceId,
        generation: u64,
        call: u64,
    },
    /// Publish delayed values of a voice's accessed attributes.
    RefreshKeys {
        voice: VoiceId,
        generation: u64,
        values: Vec<(String, Value)>,
    },
    SetTempo(Tempo),
    Call(Box<dyn FnOnce(&mut Engine) + Send>),
}

impl Task {
    /// Priority tasks run before everything else in their block.
    pub fn is_priority(&self) -> bool {
        matches!(self, Task::SetTempo(_))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fire { voice, generation } => f
                .debug_struct("Fire")
                .field("voice", voice)
                .field("generation", generation)
                .finish(),
            Task::Method {
                voice,
                generation,
                call,
            } => f
                .debug_struct("Method")
                .field("voice", voice)
                .field("generation", generation)
                .field("call", call)
                .finish(),
            Task::RefreshKeys {
                voice,
                generation,
                values,
            } => f
                .debug_struct("RefreshKeys")
                .field("voice", voice)
                .field("generation", generation)
                .field("values", values)
                .finish(),
            Task::SetTempo(tempo) => f.debug_tuple("SetTempo").field(tempo).finish(),
            Task::Call(_) => f.write_str("Call(..)"),
        }
    }
}

/// Every task due at one beat, in the order they run.
#[derive(Debug)]
pub struct QueueBlock {
    beat: Beat,
    tasks: VecDeque<Task>,
    /// Voices fired (or due to fire) in this block, with their generation.
    fires: BTreeMap<VoiceId, u64>,
}

impl QueueBlock {
    pub fn new(beat: Beat) -> Self {
        QueueBlock {
            beat,
            tasks: VecDeque::new(),
            fires: BTreeMap::new(),
        }
    }

    pub fn beat(&self) -> Beat {
        self.beat
    }

    /// Add a task. A second fire for the same voice and generation is
    /// rejected and `false` returned.
    pub fn add(&mut self, task: Task) -> bool {
        if let Task::Fire { voice, generation } = &task {
            if self.fires.get(voice) == Some(generation) {
                return false;
            }
            self.fires.insert(voice.clone(), *generation);
        }
        if task.is_priority() {
            let at = self.tasks.iter().take_while(|t| t.is_priority()).count();
            self.tasks.insert(at, task);
        } else {
            self.tasks.push_back(task);
        }
        true
    }

    /// Take the next task to run.
    pub fn next_task(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Voices with a fire task still waiting in this block.
    pub fn pending_voices(&self) -> BTreeSet<VoiceId> {
        self.tasks
            .iter()
            .filter_map(|task| match task {
                Task::Fire { voice, .. } => Some(voice.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Blocks ordered by beat.
#[derive(Debug, Default)]
pub struct SchedulingQueue {
    blocks: BTreeMap<Beat, QueueBlock>,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `task` to the block at `beat`, creating the block if needed.
    pub fn schedule(&mut self, beat: Beat, task: Task) -> bool {
        self.blocks
            .entry(beat)
            .or_insert_with(|| QueueBlock::new(beat))
            .add(task)
    }

    /// Beat of the earliest block.
    pub fn next_beat(&self) -> Option<Beat> {
        self.blocks.keys().next().copied()
    }

    /// Remove and return the earliest block if it is due at `now` (beats).
    pub fn pop_due(&mut self, now: f64) -> Option<QueueBlock> {
        let beat = self.next_beat()?;
        if beat.to_f64() > now {
            return None;
        }
        self.blocks.remove(&beat)
    }

    pub fn block(&self, beat: Beat) -> Option<&QueueBlock> {
        self.blocks.get(&beat)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
