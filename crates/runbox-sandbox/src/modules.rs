//! JavaScript sources for the modules a script may `require`.
//!
//! Each source is an expression evaluating to a factory. The factory receives
//! the captured op table (and, for `crypto`, the `Buffer` class) and returns
//! the module object. Factories run lazily on first `require`.

/// `Buffer`: a `Uint8Array` subclass with Node's common encoding helpers.
pub const BUFFER_SOURCE: &str = r#"
((ops) => {
    const normEnc = (enc) => (enc === undefined || enc === null ? 'utf8' : String(enc));

    class Buffer extends Uint8Array {
        static from(value, encodingOrOffset, length) {
            if (typeof value === 'string') {
                return Buffer.__wrap(ops.op_runbox_decode(value, normEnc(encodingOrOffset)));
            }
            if (value instanceof ArrayBuffer) {
                const offset = encodingOrOffset || 0;
                const len = length === undefined ? value.byteLength - offset : length;
                return Buffer.__wrap(new Uint8Array(value, offset, len));
            }
            if (ArrayBuffer.isView(value)) {
                return Buffer.__wrap(new Uint8Array(value.buffer, value.byteOffset, value.byteLength));
            }
            if (Array.isArray(value)) {
                return Buffer.__wrap(Uint8Array.from(value, (v) => Number(v) & 0xff));
            }
            if (value && value.type === 'Buffer' && Array.isArray(value.data)) {
                return Buffer.from(value.data);
            }
            throw new TypeError('The first argument must be a string, Buffer, ArrayBuffer, or Array');
        }

        static __wrap(bytes) {
            const buf = new Buffer(bytes.length);
            buf.set(bytes);
            return buf;
        }

        static alloc(size, fill) {
            const buf = new Buffer(size);
            if (fill !== undefined) {
                if (typeof fill === 'string') {
                    const pattern = ops.op_runbox_decode(fill, 'utf8');
                    for (let i = 0; i < size && pattern.length > 0; i++) buf[i] = pattern[i % pattern.length];
                } else {
                    buf.fill(Number(fill) & 0xff);
                }
            }
            return buf;
        }

        static isBuffer(value) {
            return value instanceof Buffer;
        }

        static byteLength(value, encoding) {
            if (typeof value !== 'string') return value.byteLength;
            return ops.op_runbox_decode(value, normEnc(encoding)).length;
        }

        static concat(list, totalLength) {
            const total = totalLength === undefined
                ? list.reduce((n, b) => n + b.length, 0)
                : totalLength;
            const out = Buffer.alloc(total);
            let offset = 0;
            for (const b of list) {
                if (offset >= total) break;
                const chunk = b.subarray(0, total - offset);
                out.set(chunk, offset);
                offset += chunk.length;
            }
            return out;
        }

        toString(encoding, start, end) {
            const view = this.subarray(start || 0, end === undefined ? this.length : end);
            return ops.op_runbox_encode(new Uint8Array(view), normEnc(encoding));
        }

        equals(other) {
            if (this.length !== other.length) return false;
            for (let i = 0; i < this.length; i++) if (this[i] !== other[i]) return false;
            return true;
        }

        toJSON() {
            return { type: 'Buffer', data: Array.from(this) };
        }
    }

    return Buffer;
})
"#;

/// `path`: POSIX path utilities. The working directory is `/`.
pub const PATH_SOURCE: &str = r#"
(() => {
    const assertPath = (p) => {
        if (typeof p !== 'string') throw new TypeError('Path must be a string. Received ' + typeof p);
    };

    const normalizeSegments = (path, allowAboveRoot) => {
        const out = [];
        for (const seg of path.split('/')) {
            if (seg === '' || seg === '.') continue;
            if (seg === '..') {
                if (out.length > 0 && out[out.length - 1] !== '..') out.pop();
                else if (allowAboveRoot) out.push('..');
                continue;
            }
            out.push(seg);
        }
        return out;
    };

    const path = {
        sep: '/',
        delimiter: ':',
        normalize(p) {
            assertPath(p);
            if (p === '') return '.';
            const absolute = p.startsWith('/');
            const trailing = p.endsWith('/');
            let joined = normalizeSegments(p, !absolute).join('/');
            if (joined === '' && !absolute) joined = '.';
            if (joined !== '' && trailing) joined += '/';
            return (absolute ? '/' : '') + joined;
        },
        join(...parts) {
            parts.forEach(assertPath);
            const joined = parts.filter((p) => p !== '').join('/');
            return joined === '' ? '.' : path.normalize(joined);
        },
        resolve(...parts) {
            let resolved = '';
            for (let i = parts.length - 1; i >= 0 && !resolved.startsWith('/'); i--) {
                assertPath(parts[i]);
                if (parts[i] === '') continue;
                resolved = resolved === '' ? parts[i] : parts[i] + '/' + resolved;
            }
            if (!resolved.startsWith('/')) resolved = '/' + resolved;
            const out = '/' + normalizeSegments(resolved, false).join('/');
            return out;
        },
        isAbsolute(p) {
            assertPath(p);
            return p.startsWith('/');
        },
        dirname(p) {
            assertPath(p);
            if (p === '') return '.';
            const trimmed = p.length > 1 ? p.replace(/\/+$/, '') : p;
            const idx = trimmed.lastIndexOf('/');
            if (idx === -1) return '.';
            if (idx === 0) return '/';
            return trimmed.slice(0, idx);
        },
        basename(p, ext) {
            assertPath(p);
            const trimmed = p.length > 1 ? p.replace(/\/+$/, '') : p;
            let base = trimmed.slice(trimmed.lastIndexOf('/') + 1);
            if (ext !== undefined && base.endsWith(ext) && base !== ext) {
                base = base.slice(0, base.length - ext.length);
            }
            return base;
        },
        extname(p) {
            const base = path.basename(p);
            const idx = base.lastIndexOf('.');
            if (idx <= 0) return '';
            return base.slice(idx);
        },
        relative(from, to) {
            const a = normalizeSegments(path.resolve(from), false);
            const b = normalizeSegments(path.resolve(to), false);
            let i = 0;
            while (i < a.length && i < b.length && a[i] === b[i]) i++;
            return [...Array(a.length - i).fill('..'), ...b.slice(i)].join('/');
        },
        parse(p) {
            assertPath(p);
            const root = p.startsWith('/') ? '/' : '';
            const base = path.basename(p);
            const ext = path.extname(p);
            let dir = path.dirname(p);
            if (dir === '.' && !p.includes('/')) dir = '';
            return { root, dir, base, ext, name: ext ? base.slice(0, base.length - ext.length) : base };
        },
        format(obj) {
            const dir = obj.dir || obj.root || '';
            const base = obj.base || (obj.name || '') + (obj.ext || '');
            if (!dir) return base;
            return dir === obj.root ? dir + base : dir + '/' + base;
        },
    };
    path.posix = path;
    return Object.freeze(path);
})
"#;

/// `util`: formatting and small helpers.
pub const UTIL_SOURCE: &str = r#"
(() => {
    const inspect = (value, opts) => {
        const depth = opts && opts.depth !== undefined ? opts.depth : 2;
        const seen = new Set();
        const fmt = (v, level) => {
            if (typeof v === 'string') return level === 0 ? v : `'${v}'`;
            if (typeof v === 'bigint') return `${v}n`;
            if (typeof v === 'symbol') return v.toString();
            if (typeof v === 'function') return `[Function: ${v.name || '(anonymous)'}]`;
            if (v === null || typeof v !== 'object') return String(v);
            if (seen.has(v)) return '[Circular *1]';
            if (v instanceof Date) return v.toISOString();
            if (v instanceof RegExp) return String(v);
            if (v instanceof Error) return v.stack || `${v.name}: ${v.message}`;
            if (level > depth) return Array.isArray(v) ? '[Array]' : '[Object]';
            seen.add(v);
            let out;
            if (Array.isArray(v)) {
                out = v.length === 0 ? '[]' : `[ ${v.map((x) => fmt(x, level + 1)).join(', ')} ]`;
            } else if (v instanceof Map) {
                const items = [...v].map(([k, x]) => `${fmt(k, level + 1)} => ${fmt(x, level + 1)}`);
                out = `Map(${v.size}) {${items.length ? ' ' + items.join(', ') + ' ' : ''}}`;
            } else if (v instanceof Set) {
                const items = [...v].map((x) => fmt(x, level + 1));
                out = `Set(${v.size}) {${items.length ? ' ' + items.join(', ') + ' ' : ''}}`;
            } else {
                const keys = Object.keys(v);
                const body = keys.map((k) => {
                    const key = /^[A-Za-z_$][\w$]*$/.test(k) ? k : `'${k}'`;
                    return `${key}: ${fmt(v[k], level + 1)}`;
                });
                out = body.length === 0 ? '{}' : `{ ${body.join(', ')} }`;
            }
            seen.delete(v);
            return out;
        };
        return fmt(value, 0);
    };

    const format = (first, ...args) => {
        if (typeof first !== 'string') {
            return [first, ...args].map((a) => (typeof a === 'string' ? a : inspect(a))).join(' ');
        }
        let i = 0;
        let out = first.replace(/%[sdifjoO%]/g, (token) => {
            if (token === '%%') return '%';
            if (i >= args.length) return token;
            const arg = args[i++];
            switch (token) {
                case '%s': return typeof arg === 'string' ? arg : inspect(arg);
                case '%d': return String(Number(arg));
                case '%i': return String(parseInt(arg, 10));
                case '%f': return String(parseFloat(arg));
                case '%j':
                    try { return JSON.stringify(arg); } catch (_) { return '[Circular]'; }
                default: return inspect(arg);
            }
        });
        for (; i < args.length; i++) {
            const arg = args[i];
            out += ' ' + (typeof arg === 'string' ? arg : inspect(arg));
        }
        return out;
    };

    const isDeepStrictEqual = (a, b) => {
        if (Object.is(a, b)) return true;
        if (typeof a !== 'object' || typeof b !== 'object' || a === null || b === null) return false;
        if (Object.getPrototypeOf(a) !== Object.getPrototypeOf(b)) return false;
        if (a instanceof Date) return a.getTime() === b.getTime();
        const ka = Object.keys(a);
        const kb = Object.keys(b);
        if (ka.length !== kb.length) return false;
        return ka.every((k) => Object.prototype.hasOwnProperty.call(b, k) && isDeepStrictEqual(a[k], b[k]));
    };

    const promisify = (fn) => {
        if (typeof fn !== 'function') throw new TypeError('The "original" argument must be of type function');
        return (...args) => new Promise((resolve, reject) => {
            fn(...args, (err, value) => (err ? reject(err) : resolve(value)));
        });
    };

    const inherits = (ctor, superCtor) => {
        Object.setPrototypeOf(ctor.prototype, superCtor.prototype);
        Object.setPrototypeOf(ctor, superCtor);
    };

    const deprecate = (fn, msg) => {
        let warned = false;
        return function (...args) {
            if (!warned) {
                warned = true;
                console.warn(`DeprecationWarning: ${msg}`);
            }
            return fn.apply(this, args);
        };
    };

    const types = Object.freeze({
        isDate: (v) => v instanceof Date,
        isRegExp: (v) => v instanceof RegExp,
        isPromise: (v) => v instanceof Promise,
        isMap: (v) => v instanceof Map,
        isSet: (v) => v instanceof Set,
    });

    return Object.freeze({
        format,
        inspect,
        isDeepStrictEqual,
        promisify,
        inherits,
        deprecate,
        types,
        isArray: Array.isArray,
    });
})
"#;

/// `crypto`: hashing, HMAC, and randomness backed by host ops.
pub const CRYPTO_SOURCE: &str = r#"
((ops, Buffer) => {
    const toBytes = (data, encoding) => {
        if (typeof data === 'string') return ops.op_runbox_decode(data, encoding || 'utf8');
        if (ArrayBuffer.isView(data)) return new Uint8Array(data.buffer, data.byteOffset, data.byteLength);
        if (data instanceof ArrayBuffer) return new Uint8Array(data);
        throw new TypeError('The "data" argument must be of type string or an instance of Buffer, TypedArray, or DataView');
    };

    const concat = (chunks) => {
        const total = chunks.reduce((n, c) => n + c.length, 0);
        const out = new Uint8Array(total);
        let offset = 0;
        for (const c of chunks) {
            out.set(c, offset);
            offset += c.length;
        }
        return out;
    };

    class Hash {
        constructor(compute) {
            this.__compute = compute;
            this.__chunks = [];
            this.__done = false;
        }

        update(data, encoding) {
            if (this.__done) throw new Error('Digest already called');
            this.__chunks.push(new Uint8Array(toBytes(data, encoding)));
            return this;
        }

        digest(encoding) {
            if (this.__done) throw new Error('Digest already called');
            this.__done = true;
            const out = Buffer.from(this.__compute(concat(this.__chunks)));
            return encoding ? out.toString(encoding) : out;
        }
    }

    const createHash = (algorithm) => {
        const alg = String(algorithm);
        // Validate eagerly so unsupported algorithms fail at creation.
        ops.op_runbox_digest(alg, new Uint8Array(0));
        return new Hash((bytes) => ops.op_runbox_digest(alg, bytes));
    };

    const createHmac = (algorithm, key) => {
        const alg = String(algorithm);
        const keyBytes = new Uint8Array(toBytes(key));
        ops.op_runbox_hmac(alg, keyBytes, new Uint8Array(0));
        return new Hash((bytes) => ops.op_runbox_hmac(alg, keyBytes, bytes));
    };

    const randomBytes = (size) => {
        if (!Number.isInteger(size) || size < 0) {
            throw new RangeError('The "size" argument must be a non-negative integer');
        }
        return Buffer.from(ops.op_runbox_random_bytes(size));
    };

    const randomInt = (min, max) => {
        if (max === undefined) {
            max = min;
            min = 0;
        }
        if (!Number.isSafeInteger(min) || !Number.isSafeInteger(max) || max <= min) {
            throw new RangeError('The "max" argument must be greater than "min"');
        }
        const bytes = ops.op_runbox_random_bytes(6);
        let n = 0;
        for (const b of bytes) n = n * 256 + b;
        return min + (n % (max - min));
    };

    const timingSafeEqual = (a, b) => {
        if (a.byteLength !== b.byteLength) throw new RangeError('Input buffers must have the same byte length');
        let diff = 0;
        for (let i = 0; i < a.length; i++) diff |= a[i] ^ b[i];
        return diff === 0;
    };

    return Object.freeze({
        createHash,
        createHmac,
        randomBytes,
        randomInt,
        randomUUID: () => ops.op_runbox_random_uuid(),
        timingSafeEqual,
        getHashes: () => ['sha1', 'sha256', 'sha384', 'sha512'],
    });
})
"#;
