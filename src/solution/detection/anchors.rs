// SSD anchor layout for the short range BlazeFace model. Layers sharing a
// stride are merged, and every anchor has a fixed unit size, so only the
// centers matter.

const NUM_LAYERS: usize = 4;
const STRIDES: [u32; NUM_LAYERS] = [8, 16, 16, 16];
// One anchor for aspect ratio 1.0 plus one interpolated anchor per layer.
const ANCHORS_PER_LAYER: usize = 2;
const ANCHOR_OFFSET: f32 = 0.5;

pub const NUM_ANCHORS: usize = 896;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    /// Normalized center, 0..1 over the model input.
    pub x: f32,
    pub y: f32,
}

pub fn gen_anchors(input_size: u32) -> Vec<Anchor> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    let mut layer = 0;
    while layer < NUM_LAYERS {
        let stride = STRIDES[layer];
        let mut per_cell = 0;
        let mut last = layer;
        while last < NUM_LAYERS && STRIDES[last] == stride {
            per_cell += ANCHORS_PER_LAYER;
            last += 1;
        }

        let cells = input_size.div_ceil(stride);
        for y in 0..cells {
            for x in 0..cells {
                let anchor = Anchor {
                    x: (x as f32 + ANCHOR_OFFSET) / cells as f32,
                    y: (y as f32 + ANCHOR_OFFSET) / cells as f32,
                };
                anchors.extend(std::iter::repeat_n(anchor, per_cell));
            }
        }

        layer = last;
    }

    anchors
}
