//! ISAAC keystream used to obfuscate packet opcodes.
//!
//! Both ends seed a pair of ciphers from the same four login seeds. The side
//! that *decodes* uses the raw seeds, the side that *encodes* uses every seed
//! plus [`ENCODE_SEED_OFFSET`]. Each cipher must be advanced exactly once per
//! packet, in packet order, or the two ends drift apart permanently.

const SIZE_LOG: u32 = 8;
const SIZE: usize = 1 << SIZE_LOG;
const GOLDEN_RATIO: u32 = 0x9e37_79b9;

/// Offset added to every login seed for the server-to-client direction.
pub const ENCODE_SEED_OFFSET: u32 = 50;

/// A deterministic source of opcode keys.
pub trait Keystream: Send {
    fn next_key(&mut self) -> u32;

    /// Obfuscates an opcode, consuming one key.
    fn encode_opcode(&mut self, opcode: u8) -> u8 {
        (opcode as u32).wrapping_add(self.next_key()) as u8
    }

    /// Reverses [`Keystream::encode_opcode`], consuming one key.
    fn decode_opcode(&mut self, byte: u8) -> u8 {
        (byte as u32).wrapping_sub(self.next_key()) as u8
    }
}

#[derive(Clone)]
pub struct IsaacCipher {
    count: usize,
    results: [u32; SIZE],
    memory: [u32; SIZE],
    a: u32,
    b: u32,
    c: u32,
}

impl std::fmt::Debug for IsaacCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsaacCipher")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl IsaacCipher {
    pub fn new(seed: &[u32]) -> Self {
        let mut cipher = Self {
            count: 0,
            results: [0; SIZE],
            memory: [0; SIZE],
            a: 0,
            b: 0,
            c: 0,
        };
        let len = seed.len().min(SIZE);
        cipher.results[..len].copy_from_slice(&seed[..len]);
        cipher.init();
        cipher
    }

    fn init(&mut self) {
        let mut h = [GOLDEN_RATIO; 8];
        for _ in 0..4 {
            mix(&mut h);
        }

        for i in (0..SIZE).step_by(8) {
            for (j, value) in h.iter_mut().enumerate() {
                *value = value.wrapping_add(self.results[i + j]);
            }
            mix(&mut h);
            self.memory[i..i + 8].copy_from_slice(&h);
        }

        for i in (0..SIZE).step_by(8) {
            for (j, value) in h.iter_mut().enumerate() {
                *value = value.wrapping_add(self.memory[i + j]);
            }
            mix(&mut h);
            self.memory[i..i + 8].copy_from_slice(&h);
        }

        self.generate();
        self.count = SIZE;
    }

    fn generate(&mut self) {
        self.c = self.c.wrapping_add(1);
        self.b = self.b.wrapping_add(self.c);

        for i in 0..SIZE {
            let x = self.memory[i];
            self.a ^= match i & 3 {
                0 => self.a << 13,
                1 => self.a >> 6,
                2 => self.a << 2,
                _ => self.a >> 16,
            };
            self.a = self.memory[(i + SIZE / 2) & (SIZE - 1)].wrapping_add(self.a);
            let y = self.memory[((x >> 2) as usize) & (SIZE - 1)]
                .wrapping_add(self.a)
                .wrapping_add(self.b);
            self.memory[i] = y;
            self.b = self.memory[((y >> (SIZE_LOG + 2)) as usize) & (SIZE - 1)].wrapping_add(x);
            self.results[i] = self.b;
        }
    }
}

impl Keystream for IsaacCipher {
    fn next_key(&mut self) -> u32 {
        if self.count == 0 {
            self.generate();
            self.count = SIZE;
        }
        self.count -= 1;
        self.results[self.count]
    }
}

fn mix(h: &mut [u32; 8]) {
    h[0] ^= h[1] << 11;
    h[3] = h[3].wrapping_add(h[0]);
    h[1] = h[1].wrapping_add(h[2]);
    h[1] ^= h[2] >> 2;
    h[4] = h[4].wrapping_add(h[1]);
    h[2] = h[2].wrapping_add(h[3]);
    h[2] ^= h[3] << 8;
    h[5] = h[5].wrapping_add(h[2]);
    h[3] = h[3].wrapping_add(h[4]);
    h[3] ^= h[4] >> 16;
    h[6] = h[6].wrapping_add(h[3]);
    h[4] = h[4].wrapping_add(h[5]);
    h[4] ^= h[5] << 10;
    h[7] = h[7].wrapping_add(h[4]);
    h[5] = h[5].wrapping_add(h[6]);
    h[5] ^= h[6] >> 4;
    h[0] = h[0].wrapping_add(h[5]);
    h[6] = h[6].wrapping_add(h[7]);
    h[6] ^= h[7] << 8;
    h[1] = h[1].wrapping_add(h[6]);
    h[7] = h[7].wrapping_add(h[0]);
    h[7] ^= h[0] >> 9;
    h[2] = h[2].wrapping_add(h[7]);
    h[0] = h[0].wrapping_add(h[1]);
}

/// The two ciphers owned by one end of a session.
#[derive(Debug, Clone)]
pub struct SessionCiphers {
    pub decoder: IsaacCipher,
    pub encoder: IsaacCipher,
}

impl SessionCiphers {
    /// Server side: decodes what the client encoded with the raw seeds.
    pub fn server(seeds: [u32; 4]) -> Self {
        Self {
            decoder: IsaacCipher::new(&seeds),
            encoder: IsaacCipher::new(&offset_seeds(seeds)),
        }
    }

    /// Client side: the mirror image of [`SessionCiphers::server`].
    pub fn client(seeds: [u32; 4]) -> Self {
        Self {
            decoder: IsaacCipher::new(&offset_seeds(seeds)),
            encoder: IsaacCipher::new(&seeds),
        }
    }
}

fn offset_seeds(seeds: [u32; 4]) -> [u32; 4] {
    seeds.map(|seed| seed.wrapping_add(ENCODE_SEED_OFFSET))
}

/// Splits the two 64-bit login keys into the four cipher seeds.
pub fn seeds_from_keys(client_key: u64, server_key: u64) -> [u32; 4] {
    [
        (client_key >> 32) as u32,
        client_key as u32,
        (server_key >> 32) as u32,
        server_key as u32,
    ]
}
