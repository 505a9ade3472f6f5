/// Index of a NUMA node. Negative values mean "no particular node".
pub type NodeId = i32;

pub const NO_NODE: NodeId = -1;

/// Where a block should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Placement {
    /// Whatever the calling thread's memory policy says.
    #[default]
    Default,
    /// The node the calling thread runs on at allocation time.
    Current,
    /// Pages are placed on the node that first touches them.
    Local,
    /// Pages are striped across every node.
    Interleaved,
    OnNode(NodeId),
}

impl Placement {
    /// The node explicitly requested, if any.
    #[inline]
    pub const fn node(&self) -> Option<NodeId> {
        match self {
            Self::OnNode(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<NodeId> for Placement {
    #[inline]
    fn from(node: NodeId) -> Self {
        if node < 0 {
            Self::Current
        } else {
            Self::OnNode(node)
        }
    }
}

impl core::fmt::Display for Placement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Current => write!(f, "current"),
            Self::Local => write!(f, "local"),
            Self::Interleaved => write!(f, "interleaved"),
            Self::OnNode(n) => write!(f, "node {}", n),
        }
    }
}

const WORD_BITS: usize = u64::BITS as usize;

/// A set of CPUs. Bit `i` of word `i / 64` stands for CPU `i`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CpuMask {
    words: Vec<u64>,
}

impl CpuMask {
    /// An empty mask able to hold `cpus` CPUs.
    pub fn new(cpus: usize) -> Self {
        Self {
            words: vec![0; cpus.div_ceil(WORD_BITS).max(1)],
        }
    }

    /// An empty mask sized for the CPUs available to this process.
    pub fn for_available() -> Self {
        Self::new(num_cpus())
    }

    /// A mask with the first `cpus` CPUs set.
    pub fn full(cpus: usize) -> Self {
        let mut mask = Self::new(cpus);
        (0..cpus).for_each(|cpu| mask.set(cpu));
        mask
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    pub fn set(&mut self, cpu: usize) {
        let word = cpu / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (cpu % WORD_BITS);
    }

    pub fn unset(&mut self, cpu: usize) {
        if let Some(w) = self.words.get_mut(cpu / WORD_BITS) {
            *w &= !(1 << (cpu % WORD_BITS));
        }
    }

    #[inline]
    pub fn contains(&self, cpu: usize) -> bool {
        self.words
            .get(cpu / WORD_BITS)
            .is_some_and(|w| w & (1 << (cpu % WORD_BITS)) != 0)
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity()).filter(|cpu| self.contains(*cpu))
    }

    #[inline]
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::new(0);
        iter.into_iter().for_each(|cpu| mask.set(cpu));
        mask
    }
}

/// Number of CPUs available to this process.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
