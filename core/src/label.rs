/// Branch target inside a TB.
///
/// Offsets are assigned by the layout pass before emission, so
/// forward branches never need patching.
#[derive(Debug, Clone)]
pub struct Label {
    pub id: u32,
    /// Code buffer offset, once laid out.
    pub offset: Option<usize>,
}

impl Label {
    pub fn new(id: u32) -> Self {
        Self { id, offset: None }
    }

    pub fn place(&mut self, offset: usize) {
        self.offset = Some(offset);
    }
}
