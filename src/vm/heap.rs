use super::Value;
use super::fault::Fault;

/// Largest array the program may allocate.
pub const ARRAY_SIZE_MAX: usize = 1_000_000;
/// Largest opaque buffer the program may allocate.
pub const ALLOC_SIZE_MAX: usize = 1_000_000;

/// A reference to a heap allocation. Slot identity doubles as object
/// identity for the collector's visited set, so cyclic graphs mark once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRef {
    pub index: usize,
}

/// Header shared by all heap allocations.
#[derive(Debug)]
pub struct ObjectHeader {
    pub marked: bool,
}

/// A heap allocation: an array of values, an interop string, or an opaque
/// byte buffer from `ALLOC`.
#[derive(Debug)]
pub enum HeapObject {
    Array {
        header: ObjectHeader,
        elems: Vec<Value>,
    },
    Str {
        header: ObjectHeader,
        text: String,
    },
    Opaque {
        header: ObjectHeader,
        bytes: Vec<u8>,
    },
}

impl HeapObject {
    pub fn header(&self) -> &ObjectHeader {
        match self {
            HeapObject::Array { header, .. }
            | HeapObject::Str { header, .. }
            | HeapObject::Opaque { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut ObjectHeader {
        match self {
            HeapObject::Array { header, .. }
            | HeapObject::Str { header, .. }
            | HeapObject::Opaque { header, .. } => header,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            HeapObject::Array { elems, .. } => Some(elems),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            HeapObject::Array { elems, .. } => Some(elems),
            _ => None,
        }
    }

    /// Number of elements, chars, or bytes, by kind.
    pub fn len(&self) -> usize {
        match self {
            HeapObject::Array { elems, .. } => elems.len(),
            HeapObject::Str { text, .. } => text.chars().count(),
            HeapObject::Opaque { bytes, .. } => bytes.len(),
        }
    }

    fn byte_size(&self) -> usize {
        match self {
            HeapObject::Array { elems, .. } => {
                std::mem::size_of::<Self>() + elems.capacity() * std::mem::size_of::<Value>()
            }
            HeapObject::Str { text, .. } => std::mem::size_of::<Self>() + text.len(),
            HeapObject::Opaque { bytes, .. } => std::mem::size_of::<Self>() + bytes.len(),
        }
    }

    /// References held by this object, for the collector's trace step.
    fn trace(&self) -> Vec<GcRef> {
        match self {
            HeapObject::Array { elems, .. } => elems.iter().filter_map(|v| v.as_ref()).collect(),
            HeapObject::Str { .. } | HeapObject::Opaque { .. } => Vec::new(),
        }
    }
}

/// The allocation list. Every array, string, and opaque buffer a program
/// creates lives here until the collector frees it, `FREE` releases it, or
/// the VM is destroyed.
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free_list: Vec<usize>,
    bytes_allocated: usize,
    /// Allocations since the last collection, for the auto-GC trigger
    alloc_count: usize,
    gc_threshold: usize,
    heap_limit: Option<usize>,
    auto_gc: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(None, true, 4096)
    }

    pub fn with_config(heap_limit: Option<usize>, auto_gc: bool, gc_threshold: usize) -> Self {
        Self {
            objects: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            alloc_count: 0,
            gc_threshold: gc_threshold.max(1),
            heap_limit,
            auto_gc,
        }
    }

    fn check_heap_limit(&self, additional: usize) -> Result<(), Fault> {
        if let Some(limit) = self.heap_limit
            && self.bytes_allocated + additional > limit
        {
            return Err(Fault::OutOfMemory);
        }
        Ok(())
    }

    /// Allocate an array of `size` zero-initialized elements.
    pub fn alloc_array(&mut self, size: usize) -> Result<GcRef, Fault> {
        if size > ARRAY_SIZE_MAX {
            return Err(Fault::BadArg);
        }
        let obj = HeapObject::Array {
            header: ObjectHeader { marked: false },
            elems: vec![Value::Int(0); size],
        };
        self.check_heap_limit(obj.byte_size())?;
        Ok(self.insert(obj))
    }

    pub fn alloc_string(&mut self, text: String) -> Result<GcRef, Fault> {
        let obj = HeapObject::Str {
            header: ObjectHeader { marked: false },
            text,
        };
        self.check_heap_limit(obj.byte_size())?;
        Ok(self.insert(obj))
    }

    /// Allocate an opaque buffer. A size outside [1, `ALLOC_SIZE_MAX`] is
    /// the allocation failure case and reports `OutOfMemory`, the same as
    /// exhausting the heap limit.
    pub fn alloc_opaque(&mut self, size: i64) -> Result<GcRef, Fault> {
        if size < 1 || size > ALLOC_SIZE_MAX as i64 {
            return Err(Fault::OutOfMemory);
        }
        let obj = HeapObject::Opaque {
            header: ObjectHeader { marked: false },
            bytes: vec![0; size as usize],
        };
        self.check_heap_limit(obj.byte_size())?;
        Ok(self.insert(obj))
    }

    fn insert(&mut self, obj: HeapObject) -> GcRef {
        self.bytes_allocated += obj.byte_size();
        self.alloc_count += 1;
        if let Some(index) = self.free_list.pop() {
            self.objects[index] = Some(obj);
            GcRef { index }
        } else {
            let index = self.objects.len();
            self.objects.push(Some(obj));
            GcRef { index }
        }
    }

    pub fn get(&self, r: GcRef) -> Option<&HeapObject> {
        self.objects.get(r.index).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(r.index).and_then(|o| o.as_mut())
    }

    /// Release one allocation explicitly (`FREE`).
    pub fn release(&mut self, r: GcRef) -> Option<HeapObject> {
        let obj = self.objects.get_mut(r.index).and_then(|o| o.take())?;
        self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.byte_size());
        self.free_list.push(r.index);
        Some(obj)
    }

    /// Whether the auto collector should run before the next allocation.
    pub fn should_collect(&self) -> bool {
        self.auto_gc && self.alloc_count >= self.gc_threshold
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    /// Mark phase. The marked bit doubles as the visited set, so cycles of
    /// arrays terminate after one pass over each object.
    fn mark(&mut self, roots: &[GcRef]) {
        let mut worklist: Vec<GcRef> = roots.to_vec();
        while let Some(r) = worklist.pop() {
            if let Some(obj) = self.objects.get_mut(r.index).and_then(|o| o.as_mut())
                && !obj.header().marked
            {
                obj.header_mut().marked = true;
                worklist.extend(obj.trace());
            }
        }
    }

    /// Sweep phase: free unmarked allocations, clear marks on survivors.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for i in 0..self.objects.len() {
            if let Some(obj) = &mut self.objects[i] {
                if obj.header().marked {
                    obj.header_mut().marked = false;
                } else {
                    self.objects[i] = None;
                    self.free_list.push(i);
                    freed += 1;
                }
            }
        }

        self.bytes_allocated = self
            .objects
            .iter()
            .flatten()
            .map(|o| o.byte_size())
            .sum();
        self.alloc_count = 0;
        freed
    }

    /// Run a full collection cycle. Returns the number of freed objects.
    pub fn collect(&mut self, roots: &[GcRef]) -> usize {
        self.mark(roots);
        self.sweep()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
